//! Parameter synchronizer.
//!
//! Turns one `(bpm, connectivity)` pair into the fixed set of published
//! parameters and forwards only the ones whose value changed.
//!
//! | Canonical name | Type | Value |
//! |---|---|---|
//! | `HR` | int | `clamp(bpm, 0, 255)` |
//! | `onesHR` / `tensHR` / `hundredsHR` | int | decimal digits of `bpm` |
//! | `HRPercent` | float | `clamp((bpm - min) / (max - min), 0, 1)` |
//! | `FullHRPercent` | float | `2 × HRPercent - 1` |
//! | `isHRConnected` | bool | source connected |
//! | `isHRActive` | bool | connected and `bpm > 0` |
//! | `isHRBeat` | bool | heartbeat simulator output |

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::config::BridgeConfig;
use crate::transport::GameTransport;
use crate::types::{ConnectivityState, ParamValue};

/// Every published parameter, in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputParameter {
    Hr,
    Ones,
    Tens,
    Hundreds,
    Percent,
    FullPercent,
    Connected,
    Active,
    Beat,
}

impl OutputParameter {
    pub const ALL: [OutputParameter; 9] = [
        OutputParameter::Hr,
        OutputParameter::Ones,
        OutputParameter::Tens,
        OutputParameter::Hundreds,
        OutputParameter::Percent,
        OutputParameter::FullPercent,
        OutputParameter::Connected,
        OutputParameter::Active,
        OutputParameter::Beat,
    ];

    pub fn canonical_name(self) -> &'static str {
        match self {
            OutputParameter::Hr => "HR",
            OutputParameter::Ones => "onesHR",
            OutputParameter::Tens => "tensHR",
            OutputParameter::Hundreds => "hundredsHR",
            OutputParameter::Percent => "HRPercent",
            OutputParameter::FullPercent => "FullHRPercent",
            OutputParameter::Connected => "isHRConnected",
            OutputParameter::Active => "isHRActive",
            OutputParameter::Beat => "isHRBeat",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// `clamp((bpm - min) / (max - min), 0, 1)`.
pub fn hr_percent(bpm: u32, min_hr: f64, max_hr: f64) -> f32 {
    let bpm = bpm as f64;
    if bpm <= min_hr {
        return 0.0;
    }
    if bpm >= max_hr {
        return 1.0;
    }
    ((bpm - min_hr) / (max_hr - min_hr)).clamp(0.0, 1.0) as f32
}

/// Values of every parameter except [`OutputParameter::Beat`], in send order.
pub fn compute(
    bpm: u32,
    state: ConnectivityState,
    min_hr: f64,
    max_hr: f64,
) -> [(OutputParameter, ParamValue); 8] {
    let percent = hr_percent(bpm, min_hr, max_hr);
    let digit = |div: u32| ParamValue::Int(((bpm / div) % 10) as i32);
    [
        (OutputParameter::Hr, ParamValue::Int(bpm.min(255) as i32)),
        (OutputParameter::Ones, digit(1)),
        (OutputParameter::Tens, digit(10)),
        (OutputParameter::Hundreds, digit(100)),
        (OutputParameter::Percent, ParamValue::Float(percent)),
        (OutputParameter::FullPercent, ParamValue::Float(2.0 * percent - 1.0)),
        (OutputParameter::Connected, ParamValue::Bool(state.is_connected())),
        (OutputParameter::Active, ParamValue::Bool(state.is_active())),
    ]
}

/// Change-suppressing fan-out of parameters to every transport.
pub struct ParameterSync {
    names: [String; 9],
    min_hr: f64,
    max_hr: f64,
    legacy_bool: bool,
    last_sent: [Option<ParamValue>; 9],
    transports: Vec<Arc<dyn GameTransport>>,
}

impl ParameterSync {
    pub fn new(config: &BridgeConfig, transports: Vec<Arc<dyn GameTransport>>) -> Self {
        let mut sync = Self {
            names: Default::default(),
            min_hr: 0.0,
            max_hr: 255.0,
            legacy_bool: false,
            last_sent: [None; 9],
            transports,
        };
        sync.apply_config(config);
        sync
    }

    /// Rebuild names and ranges from `config`.
    ///
    /// Nothing counts as sent afterwards, so the next update publishes the
    /// full set under the (possibly new) names.
    pub fn apply_config(&mut self, config: &BridgeConfig) {
        for p in OutputParameter::ALL {
            let canonical = p.canonical_name();
            self.names[p.index()] = config
                .parameter_names
                .get(canonical)
                .cloned()
                .unwrap_or_else(|| canonical.to_owned());
        }
        self.min_hr = config.min_hr;
        self.max_hr = config.max_hr;
        self.legacy_bool = config.legacy_bool;
        self.last_sent = [None; 9];
    }

    pub fn published_name(&self, p: OutputParameter) -> &str {
        &self.names[p.index()]
    }

    pub fn last_sent(&self, p: OutputParameter) -> Option<ParamValue> {
        self.last_sent[p.index()]
    }

    /// Recompute from one upstream sample. Returns the number of parameters sent.
    pub fn update(&mut self, bpm: u32, state: ConnectivityState) -> usize {
        compute(bpm, state, self.min_hr, self.max_hr)
            .into_iter()
            .filter(|(p, v)| self.offer(*p, *v))
            .count()
    }

    /// Publish the heartbeat flag. Returns `true` if it was sent.
    pub fn set_beat(&mut self, beat: bool) -> bool {
        self.offer(OutputParameter::Beat, ParamValue::Bool(beat))
    }

    /// Resend every previously sent value once, changed or not.
    pub fn replay(&mut self) -> usize {
        let mut sent = 0;
        for p in OutputParameter::ALL {
            if let Some(value) = self.last_sent[p.index()] {
                self.transmit(p, value);
                sent += 1;
            }
        }
        debug!("params: replayed {sent} parameter(s)");
        sent
    }

    fn offer(&mut self, p: OutputParameter, value: ParamValue) -> bool {
        let slot = &self.last_sent[p.index()];
        if slot.is_some_and(|prev| !value.differs_from(&prev)) {
            return false;
        }
        self.last_sent[p.index()] = Some(value);
        self.transmit(p, value);
        true
    }

    fn transmit(&self, p: OutputParameter, value: ParamValue) {
        let value = if self.legacy_bool { value.to_legacy() } else { value };
        let name = &self.names[p.index()];
        for t in &self.transports {
            t.send(name, value);
        }
    }
}

/// Canonical name → published name, for logging the active mapping.
pub fn name_table(sync: &ParameterSync) -> BTreeMap<&'static str, String> {
    OutputParameter::ALL
        .iter()
        .map(|p| (p.canonical_name(), sync.published_name(*p).to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn sync_with(config: &BridgeConfig) -> (ParameterSync, Arc<MemoryTransport>) {
        let memory = MemoryTransport::new();
        let sync = ParameterSync::new(config, vec![memory.clone()]);
        (sync, memory)
    }

    #[test]
    fn digits_reconstruct_bpm() {
        for bpm in 0..1000u32 {
            let values = compute(bpm, ConnectivityState::Active, 0.0, 255.0);
            let int = |i: usize| match values[i].1 {
                ParamValue::Int(v) => v as u32,
                _ => unreachable!(),
            };
            assert_eq!(int(1) + 10 * int(2) + 100 * int(3), bpm);
        }
    }

    #[test]
    fn percent_is_monotonic_and_clamped() {
        let mut previous = -1.0f32;
        for bpm in 0..400u32 {
            let p = hr_percent(bpm, 40.0, 200.0);
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous);
            previous = p;
        }
        assert_eq!(hr_percent(255, 0.0, 255.0), 1.0);
        assert_eq!(hr_percent(0, 0.0, 255.0), 0.0);
    }

    #[test]
    fn end_to_end_values() {
        let (mut sync, memory) = sync_with(&BridgeConfig::default());
        sync.update(5, ConnectivityState::Active);
        assert_eq!(memory.last("HR"), Some(ParamValue::Int(5)));
        assert_eq!(memory.last("onesHR"), Some(ParamValue::Int(5)));
        assert_eq!(memory.last("tensHR"), Some(ParamValue::Int(0)));
        assert_eq!(memory.last("hundredsHR"), Some(ParamValue::Int(0)));

        sync.update(123, ConnectivityState::Active);
        assert_eq!(memory.last("HR"), Some(ParamValue::Int(123)));
        assert_eq!(memory.last("onesHR"), Some(ParamValue::Int(3)));
        assert_eq!(memory.last("tensHR"), Some(ParamValue::Int(2)));
        assert_eq!(memory.last("hundredsHR"), Some(ParamValue::Int(1)));

        sync.update(260, ConnectivityState::Active);
        assert_eq!(memory.last("HR"), Some(ParamValue::Int(255)));

        sync.update(255, ConnectivityState::Active);
        assert_eq!(memory.last("HRPercent"), Some(ParamValue::Float(1.0)));
        assert_eq!(memory.last("FullHRPercent"), Some(ParamValue::Float(1.0)));
    }

    #[test]
    fn identical_updates_send_nothing() {
        let (mut sync, memory) = sync_with(&BridgeConfig::default());
        assert_eq!(sync.update(80, ConnectivityState::Active), 8);
        memory.take();
        assert_eq!(sync.update(80, ConnectivityState::Active), 0);
        assert!(memory.take().is_empty());

        // Only the ones digit, HR and the percentages move.
        assert_eq!(sync.update(81, ConnectivityState::Active), 4);
    }

    #[test]
    fn replay_resends_each_sent_value_once() {
        let (mut sync, memory) = sync_with(&BridgeConfig::default());
        sync.update(90, ConnectivityState::Active);
        sync.set_beat(true);
        memory.take();

        assert_eq!(sync.replay(), 9);
        let replayed = memory.take();
        assert_eq!(replayed.len(), 9);
        let names: Vec<&str> = replayed.iter().map(|(n, _)| n.as_str()).collect();
        let expected: Vec<&str> = OutputParameter::ALL.iter().map(|p| p.canonical_name()).collect();
        assert_eq!(names, expected);

        // Replay does not disturb change suppression.
        assert_eq!(sync.update(90, ConnectivityState::Active), 0);
    }

    #[test]
    fn legacy_mode_casts_bools() {
        let config = BridgeConfig {
            legacy_bool: true,
            ..BridgeConfig::default()
        };
        let (mut sync, memory) = sync_with(&config);
        sync.update(70, ConnectivityState::Active);
        assert_eq!(memory.last("isHRConnected"), Some(ParamValue::Int(1)));
        assert_eq!(memory.last("isHRActive"), Some(ParamValue::Int(1)));
        // The native value is what change detection compares.
        assert_eq!(
            sync.last_sent(OutputParameter::Active),
            Some(ParamValue::Bool(true))
        );
    }

    #[test]
    fn overridden_names_are_published() {
        let mut config = BridgeConfig::default();
        config.parameter_names.insert("HR".into(), "Pulse".into());
        let (mut sync, memory) = sync_with(&config);
        sync.update(70, ConnectivityState::Connected);
        assert_eq!(memory.last("Pulse"), Some(ParamValue::Int(70)));
        assert_eq!(memory.last("HR"), None);
        assert_eq!(name_table(&sync)["HR"], "Pulse");
    }

    #[test]
    fn small_float_jitter_is_suppressed() {
        let config = BridgeConfig {
            min_hr: 0.0,
            max_hr: 100_000.0,
            ..BridgeConfig::default()
        };
        let (mut sync, _memory) = sync_with(&config);
        sync.update(100, ConnectivityState::Active);
        // 1 bpm moves the percentage by 0.00001, below the epsilon.
        assert_eq!(sync.update(101, ConnectivityState::Active), 2);
        assert_eq!(
            sync.last_sent(OutputParameter::Percent),
            Some(ParamValue::Float(0.001))
        );
    }
}
