//! Demo source that generates synthetic Leaf CAN traffic for testing
//!
//! Simulates a short commute: the car powers on, pulls away, cruises, brakes
//! with regen, parks and finally plugs in to charge. Frames are encoded with
//! the same layouts the Leaf catalog decodes, so the whole pipeline can be
//! exercised without a car.

use anyhow::Result;
use candle_core::{CanFrame, CanSource};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One batch of frames (one per topic) is produced this often
const BATCH_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Drive cycle definition
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Parked,
    Accelerate,
    Cruise,
    Regen,
    Stopped,
    Charging,
}

#[derive(Clone, Copy)]
struct CycleSegment {
    phase: Phase,
    duration: f64,     // seconds
    target_speed: f64, // km/h at end of segment
    power: f64,        // kW drawn from the pack, negative when charging
}

fn drive_cycle() -> Vec<CycleSegment> {
    vec![
        CycleSegment { phase: Phase::Parked,     duration: 4.0,  target_speed: 0.0,  power: 0.0 },
        CycleSegment { phase: Phase::Stopped,    duration: 3.0,  target_speed: 0.0,  power: 0.6 },
        CycleSegment { phase: Phase::Accelerate, duration: 8.0,  target_speed: 50.0, power: 38.0 },
        CycleSegment { phase: Phase::Cruise,     duration: 15.0, target_speed: 55.0, power: 11.0 },
        CycleSegment { phase: Phase::Regen,      duration: 5.0,  target_speed: 20.0, power: -14.0 },
        CycleSegment { phase: Phase::Accelerate, duration: 6.0,  target_speed: 80.0, power: 45.0 },
        CycleSegment { phase: Phase::Cruise,     duration: 20.0, target_speed: 82.0, power: 19.0 },
        CycleSegment { phase: Phase::Regen,      duration: 8.0,  target_speed: 0.0,  power: -18.0 },
        CycleSegment { phase: Phase::Stopped,    duration: 4.0,  target_speed: 0.0,  power: 0.6 },
        CycleSegment { phase: Phase::Charging,   duration: 27.0, target_speed: 0.0,  power: -6.6 },
    ]
}

/// Instantaneous simulated vehicle state
#[derive(Debug, Clone, PartialEq)]
pub struct DemoState {
    pub powered: bool,
    pub charging: bool,
    pub gear: u8,
    pub speed: f64,
    pub power: f64,
    pub gids: f64,
    pub soc_percent: f64,
    pub soh: f64,
    pub battery_temp: f64,
    pub motor_temp: f64,
    pub inverter_temp: f64,
    pub ambient_temp: f64,
    pub fan_speed: u8,
}

fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Simple deterministic noise from a seed
fn noise(seed: f64) -> f64 {
    let x = (seed * 12.9898 + 78.233).sin() * 43_758.547;
    x - x.floor()
}

/// Small jitter centered around 0
fn jitter(seed: f64, amplitude: f64) -> f64 {
    (noise(seed) - 0.5) * 2.0 * amplitude
}

fn compute_state(cycle: &[CycleSegment], elapsed: f64) -> DemoState {
    let cycle_duration: f64 = cycle.iter().map(|s| s.duration).sum();
    let lap = (elapsed / cycle_duration).floor();
    let t = elapsed - lap * cycle_duration;

    let mut start = 0.0;
    let mut seg_idx = cycle.len() - 1;
    for (i, seg) in cycle.iter().enumerate() {
        if start + seg.duration > t {
            seg_idx = i;
            break;
        }
        start += seg.duration;
    }

    let seg = cycle[seg_idx];
    let seg_t = ((t - start) / seg.duration).clamp(0.0, 1.0);
    let prev = if seg_idx > 0 { cycle[seg_idx - 1] } else { cycle[cycle.len() - 1] };

    let speed = lerp(prev.target_speed, seg.target_speed, smoothstep(seg_t)).max(0.0);
    let power = match seg.phase {
        Phase::Parked => 0.0,
        Phase::Charging => seg.power,
        _ => seg.power + jitter(elapsed, 0.4),
    };

    // Drain while driving, recover while charging; one cycle is net neutral-ish
    let driven = cycle
        .iter()
        .take(seg_idx)
        .map(|s| s.power * s.duration)
        .sum::<f64>()
        + seg.power * (t - start);
    let gids = (220.0 - driven / 3600.0 * 1000.0 / 80.0).clamp(0.0, 281.0);

    let moving = !matches!(seg.phase, Phase::Parked | Phase::Stopped | Phase::Charging);

    DemoState {
        powered: !matches!(seg.phase, Phase::Parked | Phase::Charging),
        charging: seg.phase == Phase::Charging,
        gear: if moving || seg.phase == Phase::Stopped { 4 } else { 1 },
        speed,
        power,
        gids,
        soc_percent: (gids / 281.0 * 100.0 * 10.0).round() / 10.0,
        soh: 92.0,
        battery_temp: 21.0 + t * 0.02,
        motor_temp: 30.0 + speed * 0.2,
        inverter_temp: 28.0 + speed * 0.15,
        ambient_temp: 17.5,
        fan_speed: if moving { 3 } else { 0 },
    }
}

// =============================================================================
// Frame encoding (inverse of the Leaf catalog decoders)
// =============================================================================

fn encode_frames(state: &DemoState) -> Vec<CanFrame> {
    let gids = state.gids.round() as u32;
    let soc_raw = (state.soc_percent * 10.0).round() as u32;

    let voltage = 330.0 + state.gids * 0.3;
    let voltage_raw = (voltage * 2.0).round() as u32;
    let current = state.power * 1000.0 / voltage;
    let current_raw = ((-current * 2.0).round() as i32 as u32) & 0x7FF;

    let rear = (state.speed * 100.0).round() as u32;
    let side = (state.speed * 208.0).round() as u32;

    let fahrenheit = |celsius: f64| (celsius * 9.0 / 5.0 + 32.0).round().clamp(0.0, 255.0) as u8;

    vec![
        CanFrame::new(
            0x11a,
            vec![
                state.gear << 4,
                ((state.powered as u8) << 6) | (1 << 4),
                0, 0, 0, 0, 0, 0,
            ],
        ),
        CanFrame::new(
            0x5bc,
            vec![(gids >> 2) as u8, ((gids & 3) << 6) as u8, 0, 0, (state.soh as u8) << 1, 0, 0, 0],
        ),
        CanFrame::new(
            0x1db,
            vec![
                (current_raw >> 3) as u8,
                ((current_raw & 7) << 5) as u8,
                (voltage_raw >> 2) as u8,
                ((voltage_raw & 3) << 6) as u8,
                0, 0, 0, 0,
            ],
        ),
        CanFrame::new(0x55b, vec![(soc_raw >> 2) as u8, ((soc_raw & 3) << 6) as u8, 0, 0, 0, 0, 0, 0]),
        CanFrame::new(
            0x1d4,
            vec![0, 0, 0, 0, 0, 0, if state.charging { 0xC0 } else { 0x00 }, 0],
        ),
        CanFrame::new(
            0x284,
            vec![
                (side >> 8) as u8,
                side as u8,
                (side >> 8) as u8,
                side as u8,
                (rear >> 8) as u8,
                rear as u8,
                0, 0,
            ],
        ),
        CanFrame::new(
            0x5c0,
            vec![0x40, 0, ((state.battery_temp + 40.0) * 2.0).round() as u8, 0, 0, 0, 0, 0],
        ),
        CanFrame::new(
            0x55a,
            vec![0, fahrenheit(state.motor_temp), fahrenheit(state.inverter_temp), 0, 0, 0, 0, 0],
        ),
        CanFrame::new(
            0x54c,
            vec![0, 0, 0, 0, 0, 0, ((state.ambient_temp + 40.0) * 2.0).round() as u8, 0],
        ),
        CanFrame::new(0x54b, vec![0, 0, 0, 0, state.fan_speed << 3, 0, 0, 0]),
    ]
}

// =============================================================================
// DemoSource
// =============================================================================

pub struct DemoSource {
    active: bool,
    start_time: Option<Instant>,
    next_batch: Option<Instant>,
    cycle: Vec<CycleSegment>,
    queue: VecDeque<CanFrame>,
    frame_count: u64,
}

impl DemoSource {
    pub fn new() -> Self {
        Self {
            active: false,
            start_time: None,
            next_batch: None,
            cycle: drive_cycle(),
            queue: VecDeque::new(),
            frame_count: 0,
        }
    }

    /// Length of one simulated drive cycle
    pub fn cycle_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cycle.iter().map(|s| s.duration).sum())
    }

    /// Simulated state `elapsed` into the cycle
    pub fn state_at(&self, elapsed: Duration) -> DemoState {
        compute_state(&self.cycle, elapsed.as_secs_f64())
    }

    /// One frame per Leaf topic, as broadcast `elapsed` into the cycle
    pub fn frames_at(&self, elapsed: Duration) -> Vec<CanFrame> {
        encode_frames(&self.state_at(elapsed))
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Default for DemoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CanSource for DemoSource {
    fn name(&self) -> &str {
        "demo"
    }

    fn start(&mut self) -> Result<()> {
        let now = Instant::now();
        self.active = true;
        self.start_time = Some(now);
        self.next_batch = Some(now);
        self.queue.clear();
        self.frame_count = 0;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.active = false;
        self.start_time = None;
        self.next_batch = None;
        self.queue.clear();
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<CanFrame>> {
        if !self.active {
            return Ok(None);
        }

        if self.queue.is_empty() {
            let now = Instant::now();
            match (self.start_time, self.next_batch) {
                (Some(start), Some(due)) if now >= due => {
                    self.queue.extend(self.frames_at(now - start));
                    self.next_batch = Some(due + BATCH_INTERVAL);
                }
                _ => return Ok(None),
            }
        }

        let frame = self.queue.pop_front();
        if frame.is_some() {
            self.frame_count += 1;
        }
        Ok(frame)
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
