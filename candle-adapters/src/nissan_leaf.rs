//! Nissan Leaf 2011 (ZE0) catalog
//!
//! Signal layouts for the EV CAN bus as documented by the Leaf community.
//! Every decoder reads bytes through [`byte`] so short frames produce no
//! update rather than a panic.

use candle_core::{Command, MetricDefinition, MetricView, Topic, VehicleDefinition};
use std::time::Duration;

pub const NAME: &str = "Nissan Leaf 2011 (ZE0)";
pub const KEY: &str = "nissan-leaf-2011-ze0";

const WH_PER_GID: f64 = 80.0;
const KM_PER_KWH: f64 = 6.2;
/// Energy the BMS keeps in reserve, kWh
const RESERVED_KWH: f64 = 1.15;
const NEW_BATTERY_KWH: f64 = 24.0;
/// Chargers stop at this state of charge
const MAX_SOC_PERCENT: f64 = 90.0;

/// Reported until the battery controller has settled
const INVALID_GIDS: u32 = 1000;

fn byte(data: &[u8], index: usize) -> Option<u32> {
    data.get(index).map(|&b| b as u32)
}

/// Estimated range in km for a charge level in gids
pub fn range_km(gids: f64) -> f64 {
    let kwh = (gids * WH_PER_GID / 1000.0 - RESERVED_KWH).max(0.0);
    (kwh * KM_PER_KWH).round()
}

/// Minutes until the charger stops, or 0 when not charging
pub fn charge_minutes(power_input_kw: f64, soc_percent: f64, soh_percent: f64) -> f64 {
    if power_input_kw <= 0.0 {
        return 0.0;
    }
    let capacity = NEW_BATTERY_KWH * soh_percent / 100.0;
    let percent_until_full = (MAX_SOC_PERCENT - soc_percent).max(0.0);
    let energy_required = capacity * percent_until_full / 100.0;
    (energy_required / power_input_kw * 60.0).round()
}

/// Battery power in kW from a 0x1DB payload; positive when discharging
fn decode_power(data: &[u8]) -> Option<Vec<f64>> {
    let voltage = ((byte(data, 2)? << 2) | (byte(data, 3)? >> 6)) as f64 / 2.0;

    let raw = (byte(data, 0)? << 3) | ((byte(data, 1)? & 0xe0) >> 5);
    // 11-bit two's complement
    let current = if raw & 0x400 != 0 {
        raw as i32 - 0x800
    } else {
        raw as i32
    };
    let current = -(current as f64) / 2.0;

    Some(vec![current * voltage / 1000.0])
}

fn decode_remaining_charge_time(metrics: &MetricView<'_>) -> Option<Vec<f64>> {
    if metrics.value("charging")? <= 0.0 {
        return Some(vec![0.0]);
    }

    let power = metrics.get("power_output")?;
    let power_output = power
        .smoothed_state()
        .and_then(|s| s.first().copied())
        .unwrap_or_else(|| power.value());

    let soc = metrics.value("soc_percent")?;
    let soh = metrics.value("soh")?;
    Some(vec![charge_minutes(-power_output, soc, soh)])
}

pub fn definition() -> VehicleDefinition {
    VehicleDefinition::new(NAME)
        .with_topic(
            Topic::new(0x11a)
                .with_name("Shift Controller")
                .with_metric(
                    MetricDefinition::new("gear")
                        .frame(|d| Some(vec![((byte(d, 0)? & 0xF0) >> 4) as f64])),
                )
                .with_metric(
                    MetricDefinition::new("powered")
                        .frame(|d| Some(vec![((byte(d, 1)? & 0x40) >> 6) as f64]))
                        .on_change(|state, _metrics| {
                            if state.first() == Some(&1.0) {
                                vec![Command::TripStart]
                            } else {
                                vec![Command::TripEnd]
                            }
                        })
                        .logged(),
                )
                .with_metric(
                    MetricDefinition::new("eco")
                        .frame(|d| Some(vec![((byte(d, 1)? & 0x10) >> 4) as f64])),
                ),
        )
        .with_topic(
            Topic::new(0x5bc)
                .with_name("Lithium Battery Controller (500ms)")
                .with_metric(MetricDefinition::new("soc_gids").frame(|d| {
                    let gids = (byte(d, 0)? << 2) | (byte(d, 1)? >> 6);
                    (gids < INVALID_GIDS).then(|| vec![gids as f64])
                }))
                .with_metric(
                    MetricDefinition::new("soh")
                        .with_suffix("%")
                        .frame(|d| Some(vec![((byte(d, 4)? & 0xFE) >> 1) as f64])),
                ),
        )
        .with_topic(
            Topic::new(0x1db)
                .with_name("Lithium Battery Controller (10ms)")
                .with_metric(
                    MetricDefinition::new("power_output")
                        .with_suffix(" kW")
                        .with_cooldown(Duration::from_millis(80))
                        .with_precision(2)
                        .smoothed()
                        .frame(decode_power),
                ),
        )
        .with_topic(
            Topic::new(0x55b)
                .with_name("Lithium Battery Controller (10ms)")
                .with_metric(
                    MetricDefinition::new("soc_percent")
                        .with_suffix("%")
                        .frame(|d| {
                            Some(vec![((byte(d, 0)? << 2) | (byte(d, 1)? >> 6)) as f64 / 10.0])
                        }),
                ),
        )
        .with_topic(
            Topic::new(0x1d4)
                .with_name("Vehicle Control Module (10ms)")
                .with_metric(
                    // The CAN bus sleeps while plugged in, so an old value
                    // cannot be trusted
                    MetricDefinition::new("charging")
                        .with_timeout(Duration::from_secs(10))
                        .frame(|d| {
                            let val = byte(d, 6)? & 0xE0;
                            Some(vec![if val == 192 || val == 224 { 1.0 } else { 0.0 }])
                        }),
                )
                .with_metric(
                    MetricDefinition::new("remaining_charge_time")
                        .with_suffix("minutes")
                        .with_cooldown(Duration::from_secs(5))
                        .with_dependencies(&["charging", "power_output", "soc_percent", "soh"])
                        .derived(|metrics, _current| decode_remaining_charge_time(metrics)),
                ),
        )
        .with_topic(
            Topic::new(0x284).with_name("ABS Module").with_metric(
                MetricDefinition::new("wheel_speed")
                    .with_suffix(" km/h")
                    .with_default_state(vec![0.0, 0.0, 0.0])
                    .with_precision(2)
                    .with_cooldown(Duration::from_millis(100))
                    .frame(|d| {
                        let rear = ((byte(d, 4)? << 8) | byte(d, 5)?) as f64 / 100.0;
                        let left = ((byte(d, 2)? << 8) | byte(d, 3)?) as f64 / 208.0;
                        let right = ((byte(d, 0)? << 8) | byte(d, 1)?) as f64 / 208.0;
                        Some(vec![rear, left, right])
                    }),
            ),
        )
        .with_topic(
            Topic::new(0x5c0)
                .with_name("Lithium Battery Controller (500ms)")
                .with_metric(
                    // Only every other frame carries the temperature
                    MetricDefinition::new("battery_temp")
                        .with_suffix("°C")
                        .frame(|d| {
                            if byte(d, 0)? >> 6 != 1 {
                                return None;
                            }
                            Some(vec![byte(d, 2)? as f64 / 2.0 - 40.0])
                        }),
                ),
        )
        .with_topic(
            Topic::new(0x55a)
                .with_name("Inverter (100ms)")
                .with_metric(
                    MetricDefinition::new("motor_temp")
                        .with_suffix("°C")
                        .with_precision(2)
                        .frame(|d| Some(vec![(5.0 / 9.0) * (byte(d, 1)? as f64 - 32.0)])),
                )
                .with_metric(
                    MetricDefinition::new("inverter_temp")
                        .with_suffix("°C")
                        .with_precision(2)
                        .frame(|d| Some(vec![(5.0 / 9.0) * (byte(d, 2)? as f64 - 32.0)])),
                ),
        )
        .with_topic(
            Topic::new(0x54c).with_name("AC Auto Amp (100ms)").with_metric(
                MetricDefinition::new("ambient_temp")
                    .with_suffix("°C")
                    .frame(|d| {
                        let raw = byte(d, 6)?;
                        (raw != 0xff).then(|| vec![raw as f64 / 2.0 - 40.0])
                    }),
            ),
        )
        .with_topic(
            Topic::new(0x54b).with_name("AC Auto Amp (100ms)").with_metric(
                MetricDefinition::new("cc_fan_speed")
                    .with_timeout(Duration::from_millis(1000))
                    .frame(|d| Some(vec![((byte(d, 4)? & 0xF8) / 8) as f64])),
            ),
        )
        .with_extra_metric(
            MetricDefinition::new("range")
                .with_suffix("km")
                .with_dependencies(&["soc_gids"])
                .derived(|metrics, _current| Some(vec![range_km(metrics.value("soc_gids")?)])),
        )
}
