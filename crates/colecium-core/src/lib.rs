//! ColecoVision emulator core.
//!
//! [`console::Console`] owns the full machine: Z80 CPU, TMS9928A VDP,
//! SN76489 PSG, the Super Game Module's AY-3-8910 and RAM overlays, and the
//! Mega Cart bank-switching cartridge bus. Call
//! [`console::Console::run_frame`] at the display cadence; video comes back
//! through the framebuffer accessor and audio through the per-frame
//! audio-ready callback.

pub mod bus;
pub mod cartridge;
pub mod config;
pub mod console;
pub mod controller;
pub mod cpu;
pub mod error;
pub mod mem_block;
pub mod memory;
pub mod mixer;
pub mod psg;
pub mod rng;
pub mod serial;
pub mod sgm_psg;
pub mod vdp;

pub use cartridge::{Bios, Cartridge};
pub use config::{PaletteKind, Region};
pub use console::Console;
pub use controller::{ControllerPort, Input};
pub use error::Error;

#[cfg(test)]
mod tests {
    use ctor::ctor;
    use tracing::Level;
    use tracing_subscriber::FmtSubscriber;

    #[ctor]
    fn init_tracing() {
        let subscriber = FmtSubscriber::builder()
            .with_file(true)
            .with_line_number(true)
            .with_max_level(Level::DEBUG)
            .pretty()
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
    }
}
