fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" and never reports heart-rate
    // straps unless the binary carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription. A CLI tool has no bundle, so the
    // plist goes into the __TEXT,__info_plist section via `-sectcreate`.
    //
    // `CARGO_CFG_TARGET_OS` is the target, not the host.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
            return;
        };
        let plist = format!("{dir}/Info.plist");

        println!("cargo:rustc-link-arg-bins=-sectcreate");
        println!("cargo:rustc-link-arg-bins=__TEXT");
        println!("cargo:rustc-link-arg-bins=__info_plist");
        println!("cargo:rustc-link-arg-bins={plist}");
        println!("cargo:rerun-if-changed=Info.plist");
    }
}
