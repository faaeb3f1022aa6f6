//! 40-pin board header numbering.
//!
//! Maps physical header positions to kernel GPIO lines. Positions 8 and 10 boot
//! into UART mode on most boards but are still listed with their line numbers.

use serde::Serialize;

/// Number of kernel GPIO lines reachable from the header.
pub const GPIO_COUNT: u32 = 28;

pub const HEADER_POSITIONS: u8 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rail {
    #[serde(rename = "3.3V")]
    V3_3,
    #[serde(rename = "5.0V")]
    V5_0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum HeaderPin {
    Gpio(u32),
    Power(Rail),
    Ground,
}

use HeaderPin::{Ground, Gpio, Power};
use Rail::{V3_3, V5_0};

const HEADER: [HeaderPin; HEADER_POSITIONS as usize] = [
    Power(V3_3), // 1
    Power(V5_0),
    Gpio(2),
    Power(V5_0),
    Gpio(3), // 5
    Ground,
    Gpio(4),
    Gpio(14),
    Ground,
    Gpio(15), // 10
    Gpio(17),
    Gpio(18),
    Gpio(27),
    Ground,
    Gpio(22), // 15
    Gpio(23),
    Power(V3_3),
    Gpio(24),
    Gpio(10),
    Ground, // 20
    Gpio(9),
    Gpio(25),
    Gpio(11),
    Gpio(8),
    Ground, // 25
    Gpio(7),
    Gpio(0),
    Gpio(1),
    Gpio(5),
    Ground, // 30
    Gpio(6),
    Gpio(12),
    Gpio(13),
    Ground,
    Gpio(19), // 35
    Gpio(16),
    Gpio(26),
    Gpio(20),
    Ground,
    Gpio(21), // 40
];

/// Header entry at a 1-based position.
pub fn pin_at(position: u8) -> Option<HeaderPin> {
    if position == 0 {
        return None;
    }
    HEADER.get(position as usize - 1).copied()
}

pub fn line_for_position(position: u8) -> Option<u32> {
    match pin_at(position)? {
        Gpio(line) => Some(line),
        Power(_) | Ground => None,
    }
}

pub fn position_of_line(line: u32) -> Option<u8> {
    HEADER
        .iter()
        .position(|p| *p == Gpio(line))
        .map(|idx| idx as u8 + 1)
}
