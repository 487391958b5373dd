//! ColecoVision controller model.
//!
//! A controller presents two banks of buttons over the same IO lines: the
//! keypad plus the right fire button, and the joystick plus the left fire
//! button. A pair of strobe ports selects which bank every controller read
//! returns, and reads are active-low (the complement of the pressed bits).

use bitflags::bitflags;

bitflags! {
    /// One controller's full input state. The low byte is the keypad segment,
    /// the high byte the joystick segment; an IO read picks one of the two.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Input: u16 {
        // Segment 0: keypad and right fire button.
        const FIRE_R = 0x40;
        const KEY_1 = 0x02;
        const KEY_2 = 0x08;
        const KEY_3 = 0x03;
        const KEY_4 = 0x0D;
        const KEY_5 = 0x0C;
        const KEY_6 = 0x01;
        const KEY_7 = 0x0A;
        const KEY_8 = 0x0E;
        const KEY_9 = 0x04;
        const KEY_0 = 0x05;
        const KEY_STAR = 0x06;
        const KEY_POUND = 0x09;

        // Segment 1: joystick and left fire button, shifted into the high
        // byte so one word covers the whole controller.
        const FIRE_L = 0x40 << 8;
        const SPINNER_PLUS = 0x30 << 8;
        const SPINNER_MINUS = 0x10 << 8;
        const UP = 0x01 << 8;
        const DOWN = 0x04 << 8;
        const LEFT = 0x08 << 8;
        const RIGHT = 0x02 << 8;

        // Super Action Controller buttons.
        const SAC_YELLOW = Self::FIRE_L.bits();
        const SAC_ORANGE = Self::FIRE_R.bits();
        const SAC_PURPLE = 0x07;
        const SAC_BLUE = 0x0B;
    }
}

/// One of the two controller ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPort {
    One,
    Two,
}

impl ControllerPort {
    /// Decode the port index from an IO port number (bit 1).
    pub(crate) const fn from_io_port(port: u8) -> Self {
        if port & 0x02 != 0 { Self::Two } else { Self::One }
    }

    pub const fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }
}

/// Strobe selector plus the last input word latched from each port.
#[derive(Debug, Clone, Default)]
pub struct ControllerPorts {
    /// 0 = keypad/FireR segment, 1 = joystick/FireL segment.
    pub(crate) segment: u8,
    /// Last word returned by the input callback, per port.
    pub(crate) latched: [u16; 2],
}

impl ControllerPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.segment = 0;
        self.latched = [0, 0];
    }

    /// Writes to ports `$80-$9F` select the keypad segment.
    pub fn strobe_keypad(&mut self) {
        self.segment = 0;
    }

    /// Writes to ports `$C0-$DF` select the joystick segment.
    pub fn strobe_joystick(&mut self) {
        self.segment = 1;
    }

    /// Latch a freshly polled input word and return the active-low byte for
    /// the currently strobed segment.
    pub fn read(&mut self, port: ControllerPort, fresh: Input) -> u8 {
        let word = fresh.bits();
        self.latched[port.index()] = word;
        if self.segment != 0 {
            !((word >> 8) as u8)
        } else {
            !(word as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypad_segment_is_active_low() {
        let mut ports = ControllerPorts::new();
        ports.strobe_keypad();
        let byte = ports.read(ControllerPort::One, Input::KEY_5 | Input::FIRE_R);
        assert_eq!(byte, !(0x0C | 0x40));
    }

    #[test]
    fn joystick_segment_uses_high_byte() {
        let mut ports = ControllerPorts::new();
        ports.strobe_joystick();
        let byte = ports.read(ControllerPort::Two, Input::UP | Input::FIRE_L);
        assert_eq!(byte, !(0x01 | 0x40));
        assert_eq!(ports.latched[1], (0x01 << 8) | (0x40 << 8));
    }

    #[test]
    fn port_decoding_uses_bit_one() {
        assert_eq!(ControllerPort::from_io_port(0xFC), ControllerPort::One);
        assert_eq!(ControllerPort::from_io_port(0xFE), ControllerPort::Two);
    }

    #[test]
    fn sac_aliases_share_fire_bits() {
        assert_eq!(Input::SAC_YELLOW, Input::FIRE_L);
        assert_eq!(Input::SAC_ORANGE, Input::FIRE_R);
    }
}
