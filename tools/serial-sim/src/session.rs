//! One simulated session: feeder, interrupt pump and a minimal controller
//!
//! The controller stands in for the line parser: it acknowledges every
//! non-empty line with `ok`, answers status requests and honours feed hold,
//! cycle start and reset the way a motion controller would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serial_stream::sim::{InterruptPump, PumpStats, SimUart};
use serial_stream::{
    IoStream, NoPlatform, RealtimeCommand, RealtimeLatch, SerialState, SerialHardware, StreamPort,
};

use crate::config::SimConfig;

/// What a session did
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub lines: usize,
    pub resets: usize,
    pub realtime: RealtimeCommand,
    pub stats: PumpStats,
    pub rx_overflow: bool,
    pub divisor: u32,
    pub wire: Vec<u8>,
    pub timed_out: bool,
}

/// Foreground loop body
struct Controller<'p, P> {
    port: &'p P,
    cancel_sentinel: u8,
    line: Vec<u8>,
    hold: bool,
    lines: usize,
    resets: usize,
    seen: RealtimeCommand,
}

impl<'p, P: IoStream> Controller<'p, P> {
    fn new(port: &'p P, cancel_sentinel: u8) -> Self {
        Self {
            port,
            cancel_sentinel,
            line: Vec::new(),
            hold: false,
            lines: 0,
            resets: 0,
            seen: RealtimeCommand::empty(),
        }
    }

    /// One pass of the control loop; `true` if anything happened
    fn poll(&mut self, commands: RealtimeCommand) -> bool {
        let mut active = !commands.is_empty();
        if active {
            self.apply(commands);
        }

        if self.hold {
            return active;
        }

        while let Some(byte) = self.port.read() {
            active = true;
            self.consume(byte);
        }
        active
    }

    fn apply(&mut self, commands: RealtimeCommand) {
        self.seen |= commands;

        if commands.contains(RealtimeCommand::RESET) {
            self.port.reset_write_buffer();
            self.port.cancel_read_buffer();
            self.hold = false;
            self.resets += 1;
            info!("reset requested");
        }
        if commands.intersects(RealtimeCommand::FEED_HOLD | RealtimeCommand::SAFETY_DOOR) {
            self.hold = true;
        }
        if commands.contains(RealtimeCommand::CYCLE_START) {
            self.hold = false;
        }
        if commands.contains(RealtimeCommand::STATUS_REPORT) {
            let status = if self.hold { "<Hold>\r\n" } else { "<Idle>\r\n" };
            self.respond(status);
        }
        if commands.contains(RealtimeCommand::JOG_CANCEL) {
            debug!("jog cancel (no jog active)");
        }
    }

    fn consume(&mut self, byte: u8) {
        if byte == self.cancel_sentinel {
            self.line.clear();
            self.respond("[MSG:Reset]\r\n");
            return;
        }

        match byte {
            b'\r' | b'\n' => {
                if !self.line.is_empty() {
                    debug!("line: {}", String::from_utf8_lossy(&self.line));
                    self.line.clear();
                    self.lines += 1;
                    self.respond("ok\r\n");
                }
            }
            _ => self.line.push(byte),
        }
    }

    fn respond(&self, text: &str) {
        if !self.port.write_string(text) {
            warn!("response dropped: {:?}", text.trim_end());
        }
    }
}

/// Run `input` through a simulated port and collect what came back
pub fn run_session(config: &SimConfig, input: &[u8]) -> Result<SessionReport> {
    let uart = SimUart::new(config.clock_hz);
    let state: SerialState = SerialState::new();
    let latch: &'static RealtimeLatch = Box::leak(Box::new(RealtimeLatch::new()));
    let stop = AtomicBool::new(false);

    let deadline = Instant::now() + config.timeout();
    let wait = move || {
        thread::yield_now();
        Instant::now() < deadline
    };

    let byte_time = config.byte_time();
    let pace = config.pace;

    thread::scope(|s| -> Result<SessionReport> {
        let port = StreamPort::new(&state, &uart, wait, config.port);
        port.init(&NoPlatform)?;
        port.set_realtime_interceptor(latch);

        let pump = s.spawn(|| InterruptPump::new(&state, &uart).run(&stop));

        let line = uart.line();
        let feeder = s.spawn(move || {
            for &byte in input {
                if !line.send(byte) {
                    break;
                }
                if pace {
                    thread::sleep(byte_time);
                }
            }
        });

        let mut controller = Controller::new(&port, config.port.cancel_sentinel);
        let mut last_activity = Instant::now();
        let mut timed_out = false;

        loop {
            if controller.poll(latch.take()) {
                last_activity = Instant::now();
            } else if feeder.is_finished() && last_activity.elapsed() >= config.idle() {
                break;
            } else if Instant::now() >= deadline {
                warn!("session timed out");
                timed_out = true;
                break;
            } else {
                thread::yield_now();
            }
        }

        stop.store(true, Ordering::Release);
        let stats = pump
            .join()
            .map_err(|_| anyhow!("interrupt pump panicked"))?;
        feeder
            .join()
            .map_err(|_| anyhow!("input feeder panicked"))?;

        Ok(SessionReport {
            lines: controller.lines,
            resets: controller.resets,
            realtime: controller.seen,
            stats,
            rx_overflow: port.rx_overflow(),
            divisor: uart.divisor(),
            wire: uart.take_transmitted(),
            timed_out,
        })
    })
}

/// Baud-rate arithmetic for the `info` command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaudInfo {
    pub divisor: u32,
    pub actual_baud: f64,
    pub error_percent: f64,
}

pub fn baud_info(config: &SimConfig) -> Result<BaudInfo> {
    let uart = SimUart::new(config.clock_hz);
    let baud = config.port.baud_rate;
    let divisor = uart.baud_divisor(uart.peripheral_clock_hz(), baud)?;

    let actual_baud = config.clock_hz as f64 / divisor as f64;
    Ok(BaudInfo {
        divisor,
        actual_baud,
        error_percent: (actual_baud - baud as f64) / baud as f64 * 100.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced() -> SimConfig {
        SimConfig {
            pace: false,
            ..SimConfig::default()
        }
    }

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn test_every_line_acknowledged() {
        let report = run_session(&unpaced(), b"G21\r\nG90\r\n\r\nG0 X10 Y10\r\n").unwrap();

        assert_eq!(report.lines, 3);
        assert_eq!(report.wire, b"ok\r\nok\r\nok\r\n");
        assert_eq!(report.divisor, 938);
        assert!(!report.rx_overflow);
        assert!(!report.timed_out);
    }

    #[test]
    fn test_status_request_answered_out_of_band() {
        let report = run_session(&unpaced(), b"G1 X1 F100\n?G1 X2\n").unwrap();

        assert_eq!(report.lines, 2);
        assert!(report.realtime.contains(RealtimeCommand::STATUS_REPORT));
        assert_eq!(count(&report.wire, b"ok\r\n"), 2);
        assert_eq!(count(&report.wire, b"<Idle>\r\n"), 1);
        assert_eq!(report.stats.intercepted, 1);
    }

    #[test]
    fn test_reset_discards_partial_line() {
        let report = run_session(&unpaced(), b"G1 X\x18").unwrap();

        assert_eq!(report.lines, 0);
        assert_eq!(report.resets, 1);
        assert_eq!(report.wire, b"[MSG:Reset]\r\n");
    }

    #[test]
    fn test_baud_info() {
        let info = baud_info(&SimConfig::default()).unwrap();
        assert_eq!(info.divisor, 938);
        assert!(info.error_percent.abs() < 0.1);
    }
}
