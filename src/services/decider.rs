//! Publication Decider: decides whether a read result should be published,
//! and with which trigger.
//!
//! Grounded in `original_source/app/services/modbus_line.py`'s
//! `_maybe_publish` (on_change/interval/both branching, error-heartbeat
//! path gated on `interval_due`, `silent_for_s` accounting), generalized
//! per SPEC_FULL.md §4.6 with step/hysteresis banding for analog values.

use chrono::{DateTime, Utc};

use crate::domain::types::{ErrorCode, ParamSpec, PublishMode, RegisterType, Trigger};

/// Per-parameter state the Decider carries across polls.
#[derive(Debug, Clone, Default)]
pub struct DeciderState {
    pub last_value: Option<f64>,
    pub last_pub_ts: Option<DateTime<Utc>>,
    pub last_ok_ts: Option<DateTime<Utc>>,
    /// Effective hysteresis band `[lo, hi]` currently in force, for
    /// analog parameters configured with `step`.
    pub band: Option<(f64, f64)>,
}

/// One publication the Decider wants emitted this poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishIntent {
    pub value: Option<f64>,
    pub code: ErrorCode,
    pub message: String,
    pub trigger: Trigger,
    pub silent_for_s: i64,
}

/// Outcome of one decide() call: zero or more publications, and whether
/// the Current Store should be "touched" (successful read, nothing
/// published) so its `last_ok_ts` still advances.
#[derive(Debug, Default)]
pub struct Decision {
    pub publish: Vec<PublishIntent>,
    pub touch: bool,
}

/// Computes the base hysteresis band `[k*step, (k+1)*step)` widened by
/// `hysteresis` on each side.
fn band_for(value: f64, step: f64, hysteresis: f64) -> (f64, f64) {
    let k = (value / step).floor();
    (k * step - hysteresis, (k + 1.0) * step + hysteresis)
}

fn is_changed(state: &mut DeciderState, param: &ParamSpec, value: f64) -> bool {
    if param.register_type.is_bit() {
        return match state.last_value {
            None => true,
            Some(last) => (value as i64) != (last as i64),
        };
    }
    match param.step {
        Some(step) if step > 0.0 => {
            let hysteresis = param.hysteresis.unwrap_or(0.0);
            match state.band {
                None => {
                    state.band = Some(band_for(value, step, hysteresis));
                    true
                }
                Some((lo, hi)) => {
                    if value < lo || value > hi {
                        state.band = Some(band_for(value, step, hysteresis));
                        true
                    } else {
                        false
                    }
                }
            }
        }
        _ => match state.last_value {
            None => true,
            Some(last) => value != last,
        },
    }
}

/// Decides the publications (if any) for one read result.
pub fn decide(
    state: &mut DeciderState,
    param: &ParamSpec,
    value: Option<f64>,
    code: ErrorCode,
    message: &str,
    now: DateTime<Utc>,
) -> Decision {
    let interval_due = param.publish_interval_s > 0
        && state
            .last_pub_ts
            .map_or(true, |last| (now - last).num_seconds() >= param.publish_interval_s as i64);

    let mut decision = Decision::default();

    if code == ErrorCode::Ok {
        let value = value.expect("code=Ok implies a decoded value");
        let changed = is_changed(state, param, value);

        let mut emitted = false;
        match param.publish_mode {
            PublishMode::OnChange => {
                if changed {
                    decision.publish.push(intent(Some(value), code, message, Trigger::Change, 0));
                    emitted = true;
                }
            }
            PublishMode::Interval => {
                if interval_due {
                    decision.publish.push(intent(Some(value), code, message, Trigger::Interval, 0));
                    emitted = true;
                }
            }
            PublishMode::OnChangeAndInterval => {
                if changed {
                    decision.publish.push(intent(Some(value), code, message, Trigger::Change, 0));
                    emitted = true;
                }
                if interval_due {
                    decision.publish.push(intent(Some(value), code, message, Trigger::Interval, 0));
                    emitted = true;
                }
            }
        }

        if emitted {
            state.last_pub_ts = Some(now);
        } else {
            decision.touch = true;
        }
        state.last_value = Some(value);
        state.last_ok_ts = Some(now);
        return decision;
    }

    // Error path: heartbeat only, gated on the mode including interval.
    let silent_for_s = state.last_ok_ts.map(|t| (now - t).num_seconds()).unwrap_or(0).max(0);
    let includes_interval =
        matches!(param.publish_mode, PublishMode::Interval | PublishMode::OnChangeAndInterval);
    if includes_interval && interval_due {
        decision.publish.push(intent(None, code, message, Trigger::Heartbeat, silent_for_s));
        state.last_pub_ts = Some(now);
    }
    decision
}

fn intent(value: Option<f64>, code: ErrorCode, message: &str, trigger: Trigger, silent_for_s: i64) -> PublishIntent {
    PublishIntent { value, code, message: message.to_string(), trigger, silent_for_s }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DataType, ParamMode, WordOrder};

    fn param(publish_mode: PublishMode, publish_interval_s: u64, step: Option<f64>, hysteresis: Option<f64>) -> ParamSpec {
        ParamSpec {
            name: "p".to_string(),
            register_type: RegisterType::Holding,
            address: 0,
            words: 1,
            data_type: DataType::U16,
            word_order: WordOrder::Ab,
            scale: 1.0,
            mode: ParamMode::R,
            publish_mode,
            publish_interval_s,
            step,
            hysteresis,
            topic: None,
        }
    }

    #[test]
    fn test_on_change_first_sample_always_publishes() {
        let mut state = DeciderState::default();
        let p = param(PublishMode::OnChange, 0, None, None);
        let now = Utc::now();
        let d = decide(&mut state, &p, Some(5.0), ErrorCode::Ok, "OK", now);
        assert_eq!(d.publish.len(), 1);
        assert_eq!(d.publish[0].trigger, Trigger::Change);
    }

    #[test]
    fn test_on_change_no_emit_when_unchanged() {
        let mut state = DeciderState::default();
        let p = param(PublishMode::OnChange, 0, None, None);
        let now = Utc::now();
        decide(&mut state, &p, Some(5.0), ErrorCode::Ok, "OK", now);
        let d = decide(&mut state, &p, Some(5.0), ErrorCode::Ok, "OK", now);
        assert!(d.publish.is_empty());
        assert!(d.touch);
    }

    #[test]
    fn test_interval_mode_emits_only_when_due() {
        let mut state = DeciderState::default();
        let p = param(PublishMode::Interval, 10, None, None);
        let t0 = Utc::now();
        let d0 = decide(&mut state, &p, Some(1.0), ErrorCode::Ok, "OK", t0);
        assert_eq!(d0.publish.len(), 1);

        let d1 = decide(&mut state, &p, Some(1.0), ErrorCode::Ok, "OK", t0 + chrono::Duration::seconds(5));
        assert!(d1.publish.is_empty());

        let d2 = decide(&mut state, &p, Some(1.0), ErrorCode::Ok, "OK", t0 + chrono::Duration::seconds(11));
        assert_eq!(d2.publish.len(), 1);
        assert_eq!(d2.publish[0].trigger, Trigger::Interval);
    }

    #[test]
    fn test_on_change_and_interval_emits_both_in_order() {
        let mut state = DeciderState::default();
        let p = param(PublishMode::OnChangeAndInterval, 10, None, None);
        let t0 = Utc::now();
        decide(&mut state, &p, Some(1.0), ErrorCode::Ok, "OK", t0);

        let d = decide(&mut state, &p, Some(2.0), ErrorCode::Ok, "OK", t0 + chrono::Duration::seconds(10));
        assert_eq!(d.publish.len(), 2);
        assert_eq!(d.publish[0].trigger, Trigger::Change);
        assert_eq!(d.publish[1].trigger, Trigger::Interval);
    }

    #[test]
    fn test_hysteresis_band_suppresses_small_fluctuation() {
        let mut state = DeciderState::default();
        let p = param(PublishMode::OnChange, 0, Some(1.0), Some(0.2));
        let t0 = Utc::now();
        decide(&mut state, &p, Some(10.0), ErrorCode::Ok, "OK", t0); // band ~[9.8, 11.2)
        let d = decide(&mut state, &p, Some(10.9), ErrorCode::Ok, "OK", t0);
        assert!(d.publish.is_empty(), "value within hysteresis band should not republish");

        let d2 = decide(&mut state, &p, Some(11.5), ErrorCode::Ok, "OK", t0);
        assert_eq!(d2.publish.len(), 1, "value outside hysteresis band must publish");
    }

    #[test]
    fn test_error_heartbeat_gated_on_interval_due() {
        let mut state = DeciderState::default();
        let p = param(PublishMode::OnChangeAndInterval, 30, None, None);
        let t0 = Utc::now();
        decide(&mut state, &p, Some(1.0), ErrorCode::Ok, "OK", t0);

        let d1 = decide(&mut state, &p, None, ErrorCode::Timeout, "TIMEOUT", t0 + chrono::Duration::seconds(10));
        assert!(d1.publish.is_empty(), "error heartbeat must wait for interval_due");

        let d2 = decide(&mut state, &p, None, ErrorCode::Timeout, "TIMEOUT", t0 + chrono::Duration::seconds(31));
        assert_eq!(d2.publish.len(), 1);
        assert_eq!(d2.publish[0].trigger, Trigger::Heartbeat);
        assert_eq!(d2.publish[0].silent_for_s, 31);
    }

    #[test]
    fn test_bool_changed_ignores_scale_fraction() {
        let mut state = DeciderState::default();
        let mut p = param(PublishMode::OnChange, 0, None, None);
        p.register_type = RegisterType::Coil;
        let t0 = Utc::now();
        decide(&mut state, &p, Some(1.0), ErrorCode::Ok, "OK", t0);
        let d = decide(&mut state, &p, Some(1.0), ErrorCode::Ok, "OK", t0);
        assert!(d.publish.is_empty());
    }
}
