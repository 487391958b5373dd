//! ColecoVision memory and IO bus.
//!
//! Memory map:
//!
//! | Range           | Contents                                         |
//! |-----------------|--------------------------------------------------|
//! | `$0000-$1FFF`   | BIOS ROM, or SGM RAM when the lower overlay is on |
//! | `$2000-$5FFF`   | Expansion (open bus), or SGM RAM                 |
//! | `$6000-$7FFF`   | 1 KiB system RAM mirrored every 1 KiB, or SGM RAM |
//! | `$8000-$FFFF`   | Cartridge window, four 8 KiB pages               |
//!
//! IO decode is on `port & 0xE0`: `$80` and `$C0` flip the controller strobe
//! segment, `$A0` reaches the VDP, `$E0` writes the PSG (stalling the CPU for
//! the register load time) and reads the controllers. The SGM claims a few
//! exact ports below `$80`.

use crate::cartridge::{Bios, Cartridge};
use crate::config::DEFAULT_PSG_WRITE_DELAY;
use crate::controller::{ControllerPort, ControllerPorts, Input};
use crate::cpu::Z80Bus;
use crate::mem_block::ByteBlock;
use crate::memory::{cpu as map, io};
use crate::psg::Psg;
use crate::rng::SplitMix64;
use crate::sgm_psg::SgmPsg;
use crate::vdp::Vdp;

/// Host callback polled on every controller IO read.
pub type InputCallback = Box<dyn FnMut(ControllerPort) -> Input>;

pub struct Bus {
    pub(crate) ram: ByteBlock<{ map::RAM_SIZE }>,
    pub(crate) sgm_ram: ByteBlock<{ map::SGM_RAM_SIZE }>,
    pub(crate) controllers: ControllerPorts,
    pub(crate) bios: Option<Bios>,
    pub(crate) cart: Option<Cartridge>,
    pub(crate) sgm_lower: bool,
    pub(crate) sgm_upper: bool,

    pub(crate) vdp: Vdp,
    pub(crate) psg: Psg,
    pub(crate) sgm_psg: SgmPsg,

    input: InputCallback,
    /// CPU stall requested by peripheral access, drained by the scheduler.
    pending_delay: u32,
    pub(crate) psg_write_delay: u32,
}

impl Bus {
    pub fn new() -> Self {
        let mut bus = Self {
            ram: ByteBlock::new(),
            sgm_ram: ByteBlock::filled(0xFF),
            controllers: ControllerPorts::new(),
            bios: None,
            cart: None,
            sgm_lower: false,
            sgm_upper: false,
            vdp: Vdp::new(),
            psg: Psg::new(),
            sgm_psg: SgmPsg::new(),
            input: Box::new(|_| Input::empty()),
            pending_delay: 0,
            psg_write_delay: DEFAULT_PSG_WRITE_DELAY,
        };
        bus.power_on(&mut SplitMix64::default());
        bus
    }

    /// Reset memory and IO latches to their power-on state. Cartridge paging
    /// is left alone; it was established at load time.
    pub fn power_on(&mut self, rng: &mut SplitMix64) {
        // Garbage in RAM at boot is load-bearing: some titles read it before
        // ever writing.
        rng.fill_bytes(self.ram.as_mut_slice());
        self.sgm_ram.as_mut_slice().fill(0xFF);
        self.controllers.reset();
        self.sgm_lower = false;
        self.sgm_upper = false;
        self.pending_delay = 0;
    }

    pub fn set_input_callback(&mut self, callback: InputCallback) {
        self.input = callback;
    }

    /// Cycles of CPU stall accumulated since the last call.
    pub(crate) fn take_delay(&mut self) -> u32 {
        core::mem::take(&mut self.pending_delay)
    }

    /// Read a byte of CPU-visible memory.
    pub fn mem_read(&mut self, addr: u16) -> u8 {
        if addr <= map::BIOS_END {
            if self.sgm_lower {
                self.sgm_ram[usize::from(addr)]
            } else {
                self.bios.as_ref().map_or(0xFF, |bios| bios.read(addr))
            }
        } else if addr < map::CART_WINDOW_START {
            if self.sgm_upper {
                self.sgm_ram[usize::from(addr)]
            } else if addr >= map::RAM_WINDOW_START {
                self.ram[usize::from(addr & map::RAM_MASK)]
            } else {
                // Expansion port with nothing plugged in.
                0xFF
            }
        } else {
            self.cart.as_mut().map_or(0xFF, |cart| cart.read(addr))
        }
    }

    /// Write a byte to CPU-visible memory. Only RAM regions accept writes.
    pub fn mem_write(&mut self, addr: u16, data: u8) {
        if self.sgm_lower && addr <= map::BIOS_END {
            self.sgm_ram[usize::from(addr)] = data;
        } else if self.sgm_upper && addr >= map::EXPANSION_START && addr < map::CART_WINDOW_START
        {
            self.sgm_ram[usize::from(addr)] = data;
        } else if (map::RAM_WINDOW_START..=map::RAM_WINDOW_END).contains(&addr) {
            self.ram[usize::from(addr & map::RAM_MASK)] = data;
        }
    }

    /// Read a byte from an IO port.
    pub fn io_read(&mut self, port: u8) -> u8 {
        match port & io::GROUP_MASK {
            io::GROUP_VDP => {
                if port & 0x01 != 0 {
                    self.vdp.read_status()
                } else {
                    self.vdp.read_data()
                }
            }
            io::GROUP_PSG_INPUT => {
                let which = ControllerPort::from_io_port(port);
                let fresh = (self.input)(which);
                self.controllers.read(which, fresh)
            }
            _ => {
                if port == io::SGM_PSG_READ {
                    self.sgm_psg.read()
                } else {
                    0xFF
                }
            }
        }
    }

    /// Write a byte to an IO port.
    pub fn io_write(&mut self, port: u8, data: u8) {
        match port & io::GROUP_MASK {
            io::GROUP_STROBE_KEYPAD => self.controllers.strobe_keypad(),
            io::GROUP_VDP => {
                if port & 0x01 != 0 {
                    self.vdp.write_ctrl(data);
                } else {
                    self.vdp.write_data(data);
                }
            }
            io::GROUP_STROBE_JOYSTICK => self.controllers.strobe_joystick(),
            io::GROUP_PSG_INPUT => {
                // The SN76489 takes its time loading a register; without the
                // stall, sampled PCM plays back at the wrong pitch.
                self.pending_delay += self.psg_write_delay;
                self.psg.write(data);
            }
            _ => match port {
                io::SGM_PSG_SELECT => self.sgm_psg.select(data & 0x0F),
                io::SGM_PSG_WRITE => self.sgm_psg.write(data),
                io::SGM_UPPER_ENABLE => self.sgm_upper = true,
                io::SGM_LOWER_CONTROL => self.sgm_lower = !data & 0x02 != 0,
                _ => {}
            },
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Z80Bus for Bus {
    fn read_byte(&mut self, addr: u16) -> u8 {
        self.mem_read(addr)
    }

    fn write_byte(&mut self, addr: u16, data: u8) {
        self.mem_write(addr, data);
    }

    fn port_in(&mut self, port: u16) -> u8 {
        self.io_read(port as u8)
    }

    fn port_out(&mut self, port: u16, data: u8) {
        self.io_write(port as u8, data);
    }
}
