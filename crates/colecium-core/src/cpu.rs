//! Zilog Z80 interpreter.
//!
//! A straightforward fetch-decode-execute core: one [`Z80::step`] runs one
//! instruction (or services a pending interrupt) and returns its cycle cost.
//! Memory and IO go through the [`Z80Bus`] trait so the console's bus decides
//! what every access means.
//!
//! Decoding follows the standard x/y/z opcode field breakdown, with the DD/FD
//! index prefixes implemented as an HL-substitution mode rather than separate
//! opcode tables. Documented flag behaviour is implemented throughout, plus
//! the undocumented X/Y copies and the IXH/IXL half registers.

/// Memory and IO callbacks the CPU executes against.
pub trait Z80Bus {
    fn read_byte(&mut self, addr: u16) -> u8;
    fn write_byte(&mut self, addr: u16, data: u8);
    fn port_in(&mut self, port: u16) -> u8;
    fn port_out(&mut self, port: u16, data: u8);
}

const SF: u8 = 0x80;
const ZF: u8 = 0x40;
const YF: u8 = 0x20;
const HF: u8 = 0x10;
const XF: u8 = 0x08;
const PF: u8 = 0x04;
const NF: u8 = 0x02;
const CF: u8 = 0x01;

/// Active index-register substitution for the current instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prefix {
    None,
    Ix,
    Iy,
}

/// Z80 execution context.
///
/// Every register that a state snapshot observes is a public field; the
/// snapshot layer reads and writes them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Z80 {
    pub pc: u16,
    pub sp: u16,
    pub ix: u16,
    pub iy: u16,
    /// Internal WZ register; only observable through undocumented flags.
    pub mem_ptr: u16,

    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,

    // Shadow register bank.
    pub a_: u8,
    pub f_: u8,
    pub b_: u8,
    pub c_: u8,
    pub d_: u8,
    pub e_: u8,
    pub h_: u8,
    pub l_: u8,

    pub i: u8,
    pub r: u8,

    /// Instructions remaining until an EI takes effect.
    pub iff_delay: u8,
    pub interrupt_mode: u8,
    /// Data bus value latched by the last IRQ pulse (IM 0/2 vector byte).
    pub irq_data: u8,
    pub iff1: bool,
    pub iff2: bool,
    pub halted: bool,
    pub irq_pending: bool,
    pub nmi_pending: bool,

    /// Cycles queued by [`Z80::delay`], folded into the next step's cost.
    delay_cycles: u32,
}

impl Z80 {
    pub fn new() -> Self {
        let mut cpu = Self {
            pc: 0,
            sp: 0,
            ix: 0,
            iy: 0,
            mem_ptr: 0,
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            a_: 0,
            f_: 0,
            b_: 0,
            c_: 0,
            d_: 0,
            e_: 0,
            h_: 0,
            l_: 0,
            i: 0,
            r: 0,
            iff_delay: 0,
            interrupt_mode: 0,
            irq_data: 0,
            iff1: false,
            iff2: false,
            halted: false,
            irq_pending: false,
            nmi_pending: false,
            delay_cycles: 0,
        };
        cpu.reset();
        cpu
    }

    /// Power-on / reset state: execution restarts at address 0.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.sp = 0xFFFF;
        self.a = 0xFF;
        self.f = 0xFF;
        self.mem_ptr = 0;
        self.i = 0;
        self.r = 0;
        self.iff_delay = 0;
        self.interrupt_mode = 0;
        self.iff1 = false;
        self.iff2 = false;
        self.halted = false;
        self.irq_pending = false;
        self.nmi_pending = false;
        self.delay_cycles = 0;
    }

    /// Latch a maskable interrupt request with `data` on the bus.
    pub fn pulse_irq(&mut self, data: u8) {
        self.irq_pending = true;
        self.irq_data = data;
    }

    /// Latch a non-maskable interrupt request.
    pub fn pulse_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Stall the CPU: the cycles are added to the next step's return value.
    /// Used to model slow peripherals such as the PSG register load.
    pub fn delay(&mut self, cycles: u32) {
        self.delay_cycles += cycles;
    }

    /// Execute one instruction (or service a pending interrupt) and return
    /// the consumed cycle count.
    pub fn step(&mut self, bus: &mut impl Z80Bus) -> u32 {
        let mut cyc = if self.nmi_pending {
            self.service_nmi(bus)
        } else if self.irq_pending && self.iff1 && self.iff_delay == 0 {
            self.service_irq(bus)
        } else if self.halted {
            self.inc_r();
            4
        } else {
            let opcode = self.fetch(bus);
            self.inc_r();
            self.exec_main(bus, opcode, Prefix::None)
        };

        if self.iff_delay > 0 {
            self.iff_delay -= 1;
            if self.iff_delay == 0 {
                self.iff1 = true;
                self.iff2 = true;
            }
        }

        if self.delay_cycles > 0 {
            cyc += self.delay_cycles;
            self.delay_cycles = 0;
        }
        cyc
    }

    /// Run instructions until at least `cycles` cycles have elapsed; returns
    /// the cycles actually consumed.
    pub fn step_n(&mut self, bus: &mut impl Z80Bus, cycles: u32) -> u32 {
        let mut total = 0;
        while total < cycles {
            total += self.step(bus);
        }
        total
    }

    fn service_nmi(&mut self, bus: &mut impl Z80Bus) -> u32 {
        self.nmi_pending = false;
        self.halted = false;
        self.iff2 = self.iff1;
        self.iff1 = false;
        self.inc_r();
        let pc = self.pc;
        self.push16(bus, pc);
        self.pc = 0x0066;
        self.mem_ptr = self.pc;
        11
    }

    fn service_irq(&mut self, bus: &mut impl Z80Bus) -> u32 {
        self.irq_pending = false;
        self.halted = false;
        self.iff1 = false;
        self.iff2 = false;
        self.inc_r();
        match self.interrupt_mode {
            0 => {
                // The device jams an opcode onto the bus, typically an RST.
                let opcode = self.irq_data;
                self.exec_main(bus, opcode, Prefix::None) + 2
            }
            1 => {
                let pc = self.pc;
                self.push16(bus, pc);
                self.pc = 0x0038;
                self.mem_ptr = self.pc;
                13
            }
            _ => {
                let pc = self.pc;
                self.push16(bus, pc);
                let vector = (u16::from(self.i) << 8) | u16::from(self.irq_data);
                self.pc = self.read16(bus, vector);
                self.mem_ptr = self.pc;
                19
            }
        }
    }

    #[inline]
    fn inc_r(&mut self) {
        self.r = (self.r & 0x80) | (self.r.wrapping_add(1) & 0x7F);
    }

    #[inline]
    fn fetch(&mut self, bus: &mut impl Z80Bus) -> u8 {
        let value = bus.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch16(&mut self, bus: &mut impl Z80Bus) -> u16 {
        let lo = self.fetch(bus);
        let hi = self.fetch(bus);
        u16::from_le_bytes([lo, hi])
    }

    fn read16(&mut self, bus: &mut impl Z80Bus, addr: u16) -> u16 {
        let lo = bus.read_byte(addr);
        let hi = bus.read_byte(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    fn write16(&mut self, bus: &mut impl Z80Bus, addr: u16, value: u16) {
        bus.write_byte(addr, value as u8);
        bus.write_byte(addr.wrapping_add(1), (value >> 8) as u8);
    }

    fn push16(&mut self, bus: &mut impl Z80Bus, value: u16) {
        self.sp = self.sp.wrapping_sub(1);
        bus.write_byte(self.sp, (value >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        bus.write_byte(self.sp, value as u8);
    }

    fn pop16(&mut self, bus: &mut impl Z80Bus) -> u16 {
        let lo = bus.read_byte(self.sp);
        self.sp = self.sp.wrapping_add(1);
        let hi = bus.read_byte(self.sp);
        self.sp = self.sp.wrapping_add(1);
        u16::from_le_bytes([lo, hi])
    }

    // Register pair accessors.

    pub fn bc(&self) -> u16 {
        u16::from_le_bytes([self.c, self.b])
    }

    pub fn de(&self) -> u16 {
        u16::from_le_bytes([self.e, self.d])
    }

    pub fn hl(&self) -> u16 {
        u16::from_le_bytes([self.l, self.h])
    }

    pub fn af(&self) -> u16 {
        u16::from_le_bytes([self.f, self.a])
    }

    pub fn set_bc(&mut self, value: u16) {
        self.c = value as u8;
        self.b = (value >> 8) as u8;
    }

    pub fn set_de(&mut self, value: u16) {
        self.e = value as u8;
        self.d = (value >> 8) as u8;
    }

    pub fn set_hl(&mut self, value: u16) {
        self.l = value as u8;
        self.h = (value >> 8) as u8;
    }

    pub fn set_af(&mut self, value: u16) {
        self.f = value as u8;
        self.a = (value >> 8) as u8;
    }

    fn hl_like(&self, prefix: Prefix) -> u16 {
        match prefix {
            Prefix::None => self.hl(),
            Prefix::Ix => self.ix,
            Prefix::Iy => self.iy,
        }
    }

    fn set_hl_like(&mut self, prefix: Prefix, value: u16) {
        match prefix {
            Prefix::None => self.set_hl(value),
            Prefix::Ix => self.ix = value,
            Prefix::Iy => self.iy = value,
        }
    }

    /// 8-bit register file view; indices follow the opcode encoding
    /// (0=B 1=C 2=D 3=E 4=H 5=L 7=A). Index 6 is the memory operand and is
    /// handled by the callers.
    fn reg8_get(&self, idx: u8, prefix: Prefix) -> u8 {
        match idx {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => match prefix {
                Prefix::None => self.h,
                Prefix::Ix => (self.ix >> 8) as u8,
                Prefix::Iy => (self.iy >> 8) as u8,
            },
            5 => match prefix {
                Prefix::None => self.l,
                Prefix::Ix => self.ix as u8,
                Prefix::Iy => self.iy as u8,
            },
            _ => self.a,
        }
    }

    fn reg8_set(&mut self, idx: u8, prefix: Prefix, value: u8) {
        match idx {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 => match prefix {
                Prefix::None => self.h = value,
                Prefix::Ix => self.ix = (self.ix & 0x00FF) | (u16::from(value) << 8),
                Prefix::Iy => self.iy = (self.iy & 0x00FF) | (u16::from(value) << 8),
            },
            5 => match prefix {
                Prefix::None => self.l = value,
                Prefix::Ix => self.ix = (self.ix & 0xFF00) | u16::from(value),
                Prefix::Iy => self.iy = (self.iy & 0xFF00) | u16::from(value),
            },
            _ => self.a = value,
        }
    }

    /// Register pairs for the rp table (SP variant).
    fn rp_get(&self, p: u8, prefix: Prefix) -> u16 {
        match p {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl_like(prefix),
            _ => self.sp,
        }
    }

    fn rp_set(&mut self, p: u8, prefix: Prefix, value: u16) {
        match p {
            0 => self.set_bc(value),
            1 => self.set_de(value),
            2 => self.set_hl_like(prefix, value),
            _ => self.sp = value,
        }
    }

    /// Effective address of the memory operand: (HL), or (IX/IY + d) with
    /// the displacement fetched from the instruction stream.
    fn mem_operand_addr(&mut self, bus: &mut impl Z80Bus, prefix: Prefix) -> u16 {
        match prefix {
            Prefix::None => self.hl(),
            Prefix::Ix | Prefix::Iy => {
                let d = self.fetch(bus) as i8;
                let addr = self.hl_like(prefix).wrapping_add_signed(i16::from(d));
                self.mem_ptr = addr;
                addr
            }
        }
    }

    fn condition(&self, idx: u8) -> bool {
        match idx {
            0 => self.f & ZF == 0,
            1 => self.f & ZF != 0,
            2 => self.f & CF == 0,
            3 => self.f & CF != 0,
            4 => self.f & PF == 0,
            5 => self.f & PF != 0,
            6 => self.f & SF == 0,
            _ => self.f & SF != 0,
        }
    }

    // Flag arithmetic helpers.

    fn add8(&mut self, operand: u8, carry_in: bool) {
        let carry = u16::from(carry_in);
        let result = u16::from(self.a) + u16::from(operand) + carry;
        let value = result as u8;
        let mut f = value & (SF | YF | XF);
        if value == 0 {
            f |= ZF;
        }
        if (self.a ^ operand ^ value) & 0x10 != 0 {
            f |= HF;
        }
        if (self.a ^ value) & (operand ^ value) & 0x80 != 0 {
            f |= PF;
        }
        if result > 0xFF {
            f |= CF;
        }
        self.a = value;
        self.f = f;
    }

    fn sub8(&mut self, operand: u8, carry_in: bool) -> u8 {
        let carry = i16::from(carry_in);
        let result = i16::from(self.a) - i16::from(operand) - carry;
        let value = result as u8;
        let mut f = (value & (SF | YF | XF)) | NF;
        if value == 0 {
            f |= ZF;
        }
        if (self.a ^ operand ^ value) & 0x10 != 0 {
            f |= HF;
        }
        if (self.a ^ operand) & (self.a ^ value) & 0x80 != 0 {
            f |= PF;
        }
        if result < 0 {
            f |= CF;
        }
        self.f = f;
        value
    }

    fn cp8(&mut self, operand: u8) {
        let a = self.a;
        let value = self.sub8(operand, false);
        self.a = a;
        // CP copies X/Y from the operand, not the result.
        self.f = (self.f & !(YF | XF)) | (operand & (YF | XF));
        let _ = value;
    }

    fn logic_flags(&mut self, half: bool) {
        let mut f = self.a & (SF | YF | XF);
        if self.a == 0 {
            f |= ZF;
        }
        if half {
            f |= HF;
        }
        if self.a.count_ones() % 2 == 0 {
            f |= PF;
        }
        self.f = f;
    }

    fn inc8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        let mut f = (self.f & CF) | (result & (SF | YF | XF));
        if result == 0 {
            f |= ZF;
        }
        if result & 0x0F == 0 {
            f |= HF;
        }
        if result == 0x80 {
            f |= PF;
        }
        self.f = f;
        result
    }

    fn dec8(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        let mut f = (self.f & CF) | (result & (SF | YF | XF)) | NF;
        if result == 0 {
            f |= ZF;
        }
        if result & 0x0F == 0x0F {
            f |= HF;
        }
        if result == 0x7F {
            f |= PF;
        }
        self.f = f;
        result
    }

    fn add16(&mut self, lhs: u16, rhs: u16) -> u16 {
        let result = u32::from(lhs) + u32::from(rhs);
        let value = result as u16;
        let mut f = self.f & (SF | ZF | PF);
        f |= ((value >> 8) as u8) & (YF | XF);
        if (lhs ^ rhs ^ value) & 0x1000 != 0 {
            f |= HF;
        }
        if result > 0xFFFF {
            f |= CF;
        }
        self.f = f;
        self.mem_ptr = lhs.wrapping_add(1);
        value
    }

    fn adc16(&mut self, lhs: u16, rhs: u16) -> u16 {
        let carry = u32::from(self.f & CF);
        let result = u32::from(lhs) + u32::from(rhs) + carry;
        let value = result as u16;
        let mut f = ((value >> 8) as u8) & (SF | YF | XF);
        if value == 0 {
            f |= ZF;
        }
        if (lhs ^ rhs ^ value) & 0x1000 != 0 {
            f |= HF;
        }
        if (lhs ^ value) & (rhs ^ value) & 0x8000 != 0 {
            f |= PF;
        }
        if result > 0xFFFF {
            f |= CF;
        }
        self.f = f;
        self.mem_ptr = lhs.wrapping_add(1);
        value
    }

    fn sbc16(&mut self, lhs: u16, rhs: u16) -> u16 {
        let carry = i32::from(self.f & CF);
        let result = i32::from(lhs) - i32::from(rhs) - carry;
        let value = result as u16;
        let mut f = (((value >> 8) as u8) & (SF | YF | XF)) | NF;
        if value == 0 {
            f |= ZF;
        }
        if (lhs ^ rhs ^ value) & 0x1000 != 0 {
            f |= HF;
        }
        if (lhs ^ rhs) & (lhs ^ value) & 0x8000 != 0 {
            f |= PF;
        }
        if result < 0 {
            f |= CF;
        }
        self.f = f;
        self.mem_ptr = lhs.wrapping_add(1);
        value
    }

    /// Shared S/Z/P/X/Y update for rotate and shift results.
    fn szp_flags(&mut self, value: u8, carry: bool) {
        let mut f = value & (SF | YF | XF);
        if value == 0 {
            f |= ZF;
        }
        if value.count_ones() % 2 == 0 {
            f |= PF;
        }
        if carry {
            f |= CF;
        }
        self.f = f;
    }

    fn rot8(&mut self, op: u8, value: u8) -> u8 {
        let carry_in = self.f & CF != 0;
        let (result, carry) = match op {
            0 => (value.rotate_left(1), value & 0x80 != 0), // RLC
            1 => (value.rotate_right(1), value & 0x01 != 0), // RRC
            2 => ((value << 1) | u8::from(carry_in), value & 0x80 != 0), // RL
            3 => ((value >> 1) | (u8::from(carry_in) << 7), value & 0x01 != 0), // RR
            4 => (value << 1, value & 0x80 != 0),           // SLA
            5 => (((value as i8) >> 1) as u8, value & 0x01 != 0), // SRA
            6 => ((value << 1) | 0x01, value & 0x80 != 0),  // SLL (undocumented)
            _ => (value >> 1, value & 0x01 != 0),           // SRL
        };
        self.szp_flags(result, carry);
        result
    }

    fn daa(&mut self) {
        let mut correction = 0u8;
        let mut carry = self.f & CF != 0;
        if (self.a & 0x0F) > 0x09 || self.f & HF != 0 {
            correction |= 0x06;
        }
        if self.a > 0x99 || carry {
            correction |= 0x60;
            carry = true;
        }

        let half = if self.f & NF != 0 {
            let h = self.f & HF != 0 && (self.a & 0x0F) < 0x06;
            self.a = self.a.wrapping_sub(correction);
            h
        } else {
            let h = (self.a & 0x0F) > 0x09;
            self.a = self.a.wrapping_add(correction);
            h
        };

        let mut f = (self.f & NF) | (self.a & (SF | YF | XF));
        if self.a == 0 {
            f |= ZF;
        }
        if self.a.count_ones() % 2 == 0 {
            f |= PF;
        }
        if half {
            f |= HF;
        }
        if carry {
            f |= CF;
        }
        self.f = f;
    }

    /// Execute an unprefixed (or DD/FD-prefixed) opcode.
    fn exec_main(&mut self, bus: &mut impl Z80Bus, opcode: u8, prefix: Prefix) -> u32 {
        // The prefix byte itself costs 4 cycles on top of the base opcode.
        let pre = if prefix == Prefix::None { 0 } else { 4 };
        let x = opcode >> 6;
        let y = (opcode >> 3) & 0x07;
        let z = opcode & 0x07;
        let p = y >> 1;
        let q = y & 0x01;

        match x {
            0 => self.exec_x0(bus, prefix, pre, y, z, p, q),
            1 => {
                if opcode == 0x76 {
                    self.halted = true;
                    return 4 + pre;
                }
                // LD r,r'; when a memory operand is involved the other side
                // always refers to the real H/L registers.
                if z == 6 {
                    let addr = self.mem_operand_addr(bus, prefix);
                    let value = bus.read_byte(addr);
                    self.reg8_set(y, Prefix::None, value);
                    if prefix == Prefix::None { 7 } else { 19 }
                } else if y == 6 {
                    let addr = self.mem_operand_addr(bus, prefix);
                    let value = self.reg8_get(z, Prefix::None);
                    bus.write_byte(addr, value);
                    if prefix == Prefix::None { 7 } else { 19 }
                } else {
                    let value = self.reg8_get(z, prefix);
                    self.reg8_set(y, prefix, value);
                    4 + pre
                }
            }
            2 => {
                // ALU operations on a register or the memory operand.
                let (operand, cyc) = if z == 6 {
                    let addr = self.mem_operand_addr(bus, prefix);
                    (bus.read_byte(addr), if prefix == Prefix::None { 7 } else { 19 })
                } else {
                    (self.reg8_get(z, prefix), 4 + pre)
                };
                self.alu(y, operand);
                cyc
            }
            _ => self.exec_x3(bus, prefix, pre, y, z, p, q),
        }
    }

    fn alu(&mut self, op: u8, operand: u8) {
        match op {
            0 => self.add8(operand, false),
            1 => self.add8(operand, self.f & CF != 0),
            2 => self.a = self.sub8(operand, false),
            3 => {
                let carry = self.f & CF != 0;
                self.a = self.sub8(operand, carry);
            }
            4 => {
                self.a &= operand;
                self.logic_flags(true);
            }
            5 => {
                self.a ^= operand;
                self.logic_flags(false);
            }
            6 => {
                self.a |= operand;
                self.logic_flags(false);
            }
            _ => self.cp8(operand),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_x0(
        &mut self,
        bus: &mut impl Z80Bus,
        prefix: Prefix,
        pre: u32,
        y: u8,
        z: u8,
        p: u8,
        q: u8,
    ) -> u32 {
        match z {
            0 => match y {
                0 => 4 + pre, // NOP
                1 => {
                    core::mem::swap(&mut self.a, &mut self.a_);
                    core::mem::swap(&mut self.f, &mut self.f_);
                    4 + pre
                }
                2 => {
                    // DJNZ d
                    let d = self.fetch(bus) as i8;
                    self.b = self.b.wrapping_sub(1);
                    if self.b != 0 {
                        self.pc = self.pc.wrapping_add_signed(i16::from(d));
                        self.mem_ptr = self.pc;
                        13 + pre
                    } else {
                        8 + pre
                    }
                }
                3 => {
                    let d = self.fetch(bus) as i8;
                    self.pc = self.pc.wrapping_add_signed(i16::from(d));
                    self.mem_ptr = self.pc;
                    12 + pre
                }
                _ => {
                    let d = self.fetch(bus) as i8;
                    if self.condition(y - 4) {
                        self.pc = self.pc.wrapping_add_signed(i16::from(d));
                        self.mem_ptr = self.pc;
                        12 + pre
                    } else {
                        7 + pre
                    }
                }
            },
            1 => {
                if q == 0 {
                    let value = self.fetch16(bus);
                    self.rp_set(p, prefix, value);
                    10 + pre
                } else {
                    let lhs = self.hl_like(prefix);
                    let rhs = self.rp_get(p, prefix);
                    let value = self.add16(lhs, rhs);
                    self.set_hl_like(prefix, value);
                    11 + pre
                }
            }
            2 => match (q, p) {
                (0, 0) => {
                    bus.write_byte(self.bc(), self.a);
                    self.mem_ptr =
                        (u16::from(self.a) << 8) | (self.bc().wrapping_add(1) & 0xFF);
                    7 + pre
                }
                (0, 1) => {
                    bus.write_byte(self.de(), self.a);
                    self.mem_ptr =
                        (u16::from(self.a) << 8) | (self.de().wrapping_add(1) & 0xFF);
                    7 + pre
                }
                (0, 2) => {
                    let addr = self.fetch16(bus);
                    let value = self.hl_like(prefix);
                    self.write16(bus, addr, value);
                    self.mem_ptr = addr.wrapping_add(1);
                    16 + pre
                }
                (0, _) => {
                    let addr = self.fetch16(bus);
                    bus.write_byte(addr, self.a);
                    self.mem_ptr = (u16::from(self.a) << 8) | (addr.wrapping_add(1) & 0xFF);
                    13 + pre
                }
                (1, 0) => {
                    self.a = bus.read_byte(self.bc());
                    self.mem_ptr = self.bc().wrapping_add(1);
                    7 + pre
                }
                (1, 1) => {
                    self.a = bus.read_byte(self.de());
                    self.mem_ptr = self.de().wrapping_add(1);
                    7 + pre
                }
                (1, 2) => {
                    let addr = self.fetch16(bus);
                    let value = self.read16(bus, addr);
                    self.set_hl_like(prefix, value);
                    self.mem_ptr = addr.wrapping_add(1);
                    16 + pre
                }
                _ => {
                    let addr = self.fetch16(bus);
                    self.a = bus.read_byte(addr);
                    self.mem_ptr = addr.wrapping_add(1);
                    13 + pre
                }
            },
            3 => {
                let value = self.rp_get(p, prefix);
                let value = if q == 0 {
                    value.wrapping_add(1)
                } else {
                    value.wrapping_sub(1)
                };
                self.rp_set(p, prefix, value);
                6 + pre
            }
            4 | 5 => {
                let dec = z == 5;
                if y == 6 {
                    let addr = self.mem_operand_addr(bus, prefix);
                    let value = bus.read_byte(addr);
                    let value = if dec { self.dec8(value) } else { self.inc8(value) };
                    bus.write_byte(addr, value);
                    if prefix == Prefix::None { 11 } else { 23 }
                } else {
                    let value = self.reg8_get(y, prefix);
                    let value = if dec { self.dec8(value) } else { self.inc8(value) };
                    self.reg8_set(y, prefix, value);
                    4 + pre
                }
            }
            6 => {
                if y == 6 {
                    // The displacement precedes the immediate byte.
                    let addr = self.mem_operand_addr(bus, prefix);
                    let value = self.fetch(bus);
                    bus.write_byte(addr, value);
                    if prefix == Prefix::None { 10 } else { 19 }
                } else {
                    let value = self.fetch(bus);
                    self.reg8_set(y, prefix, value);
                    7 + pre
                }
            }
            _ => {
                match y {
                    0 => {
                        let carry = self.a & 0x80 != 0;
                        self.a = self.a.rotate_left(1);
                        self.rota_flags(carry);
                    }
                    1 => {
                        let carry = self.a & 0x01 != 0;
                        self.a = self.a.rotate_right(1);
                        self.rota_flags(carry);
                    }
                    2 => {
                        let carry = self.a & 0x80 != 0;
                        self.a = (self.a << 1) | (self.f & CF);
                        self.rota_flags(carry);
                    }
                    3 => {
                        let carry = self.a & 0x01 != 0;
                        self.a = (self.a >> 1) | ((self.f & CF) << 7);
                        self.rota_flags(carry);
                    }
                    4 => self.daa(),
                    5 => {
                        self.a = !self.a;
                        self.f = (self.f & (SF | ZF | PF | CF))
                            | HF
                            | NF
                            | (self.a & (YF | XF));
                    }
                    6 => {
                        self.f = (self.f & (SF | ZF | PF)) | CF | (self.a & (YF | XF));
                    }
                    _ => {
                        let carry = self.f & CF != 0;
                        let mut f = self.f & (SF | ZF | PF);
                        if carry {
                            f |= HF;
                        } else {
                            f |= CF;
                        }
                        self.f = f | (self.a & (YF | XF));
                    }
                }
                4 + pre
            }
        }
    }

    /// RLCA/RRCA/RLA/RRA leave S/Z/P alone.
    fn rota_flags(&mut self, carry: bool) {
        let mut f = self.f & (SF | ZF | PF);
        f |= self.a & (YF | XF);
        if carry {
            f |= CF;
        }
        self.f = f;
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_x3(
        &mut self,
        bus: &mut impl Z80Bus,
        prefix: Prefix,
        pre: u32,
        y: u8,
        z: u8,
        p: u8,
        q: u8,
    ) -> u32 {
        match z {
            0 => {
                if self.condition(y) {
                    self.pc = self.pop16(bus);
                    self.mem_ptr = self.pc;
                    11 + pre
                } else {
                    5 + pre
                }
            }
            1 => {
                if q == 0 {
                    let value = self.pop16(bus);
                    match p {
                        0 => self.set_bc(value),
                        1 => self.set_de(value),
                        2 => self.set_hl_like(prefix, value),
                        _ => self.set_af(value),
                    }
                    10 + pre
                } else {
                    match p {
                        0 => {
                            self.pc = self.pop16(bus);
                            self.mem_ptr = self.pc;
                            10 + pre
                        }
                        1 => {
                            core::mem::swap(&mut self.b, &mut self.b_);
                            core::mem::swap(&mut self.c, &mut self.c_);
                            core::mem::swap(&mut self.d, &mut self.d_);
                            core::mem::swap(&mut self.e, &mut self.e_);
                            core::mem::swap(&mut self.h, &mut self.h_);
                            core::mem::swap(&mut self.l, &mut self.l_);
                            4 + pre
                        }
                        2 => {
                            self.pc = self.hl_like(prefix);
                            4 + pre
                        }
                        _ => {
                            self.sp = self.hl_like(prefix);
                            6 + pre
                        }
                    }
                }
            }
            2 => {
                let addr = self.fetch16(bus);
                self.mem_ptr = addr;
                if self.condition(y) {
                    self.pc = addr;
                }
                10 + pre
            }
            3 => match y {
                0 => {
                    let addr = self.fetch16(bus);
                    self.pc = addr;
                    self.mem_ptr = addr;
                    10 + pre
                }
                1 => self.exec_cb(bus, prefix),
                2 => {
                    let port = self.fetch(bus);
                    let addr = (u16::from(self.a) << 8) | u16::from(port);
                    bus.port_out(addr, self.a);
                    self.mem_ptr =
                        (u16::from(self.a) << 8) | (u16::from(port).wrapping_add(1) & 0xFF);
                    11 + pre
                }
                3 => {
                    let port = self.fetch(bus);
                    let addr = (u16::from(self.a) << 8) | u16::from(port);
                    self.a = bus.port_in(addr);
                    self.mem_ptr = addr.wrapping_add(1);
                    11 + pre
                }
                4 => {
                    let sp = self.sp;
                    let value = self.read16(bus, sp);
                    let reg = self.hl_like(prefix);
                    self.write16(bus, sp, reg);
                    self.set_hl_like(prefix, value);
                    self.mem_ptr = value;
                    19 + pre
                }
                5 => {
                    let de = self.de();
                    let hl = self.hl();
                    self.set_de(hl);
                    self.set_hl(de);
                    4 + pre
                }
                6 => {
                    self.iff1 = false;
                    self.iff2 = false;
                    self.iff_delay = 0;
                    4 + pre
                }
                _ => {
                    // EI enables interrupts after the following instruction.
                    self.iff_delay = 2;
                    4 + pre
                }
            },
            4 => {
                let addr = self.fetch16(bus);
                self.mem_ptr = addr;
                if self.condition(y) {
                    let pc = self.pc;
                    self.push16(bus, pc);
                    self.pc = addr;
                    17 + pre
                } else {
                    10 + pre
                }
            }
            5 => {
                if q == 0 {
                    let value = match p {
                        0 => self.bc(),
                        1 => self.de(),
                        2 => self.hl_like(prefix),
                        _ => self.af(),
                    };
                    self.push16(bus, value);
                    11 + pre
                } else {
                    match p {
                        0 => {
                            let addr = self.fetch16(bus);
                            let pc = self.pc;
                            self.push16(bus, pc);
                            self.pc = addr;
                            self.mem_ptr = addr;
                            17 + pre
                        }
                        1 => {
                            let next = self.fetch(bus);
                            self.inc_r();
                            self.exec_main(bus, next, Prefix::Ix)
                        }
                        2 => self.exec_ed(bus),
                        _ => {
                            let next = self.fetch(bus);
                            self.inc_r();
                            self.exec_main(bus, next, Prefix::Iy)
                        }
                    }
                }
            }
            6 => {
                let operand = self.fetch(bus);
                self.alu(y, operand);
                7 + pre
            }
            _ => {
                let pc = self.pc;
                self.push16(bus, pc);
                self.pc = u16::from(y) * 8;
                self.mem_ptr = self.pc;
                11 + pre
            }
        }
    }

    fn exec_cb(&mut self, bus: &mut impl Z80Bus, prefix: Prefix) -> u32 {
        if prefix != Prefix::None {
            // DDCB/FDCB: displacement first, then the operation byte. The
            // operation always targets memory; non-BIT results are also
            // copied into the register named by the low bits.
            let d = self.fetch(bus) as i8;
            let addr = self.hl_like(prefix).wrapping_add_signed(i16::from(d));
            self.mem_ptr = addr;
            let opcode = self.fetch(bus);
            let x = opcode >> 6;
            let y = (opcode >> 3) & 0x07;
            let z = opcode & 0x07;
            let value = bus.read_byte(addr);

            match x {
                0 => {
                    let result = self.rot8(y, value);
                    bus.write_byte(addr, result);
                    if z != 6 {
                        self.reg8_set(z, Prefix::None, result);
                    }
                    23
                }
                1 => {
                    self.bit_flags(y, value, Some(addr));
                    20
                }
                2 => {
                    let result = value & !(1 << y);
                    bus.write_byte(addr, result);
                    if z != 6 {
                        self.reg8_set(z, Prefix::None, result);
                    }
                    23
                }
                _ => {
                    let result = value | (1 << y);
                    bus.write_byte(addr, result);
                    if z != 6 {
                        self.reg8_set(z, Prefix::None, result);
                    }
                    23
                }
            }
        } else {
            let opcode = self.fetch(bus);
            self.inc_r();
            let x = opcode >> 6;
            let y = (opcode >> 3) & 0x07;
            let z = opcode & 0x07;

            if z == 6 {
                let addr = self.hl();
                let value = bus.read_byte(addr);
                match x {
                    0 => {
                        let result = self.rot8(y, value);
                        bus.write_byte(addr, result);
                        15
                    }
                    1 => {
                        self.bit_flags(y, value, Some(addr));
                        12
                    }
                    2 => {
                        bus.write_byte(addr, value & !(1 << y));
                        15
                    }
                    _ => {
                        bus.write_byte(addr, value | (1 << y));
                        15
                    }
                }
            } else {
                let value = self.reg8_get(z, Prefix::None);
                match x {
                    0 => {
                        let result = self.rot8(y, value);
                        self.reg8_set(z, Prefix::None, result);
                    }
                    1 => self.bit_flags(y, value, None),
                    2 => self.reg8_set(z, Prefix::None, value & !(1 << y)),
                    _ => self.reg8_set(z, Prefix::None, value | (1 << y)),
                }
                8
            }
        }
    }

    /// BIT b,r flag update. For memory operands the X/Y bits come from the
    /// internal address latch rather than the operand.
    fn bit_flags(&mut self, bit: u8, value: u8, addr: Option<u16>) {
        let tested = value & (1 << bit);
        let mut f = (self.f & CF) | HF;
        if tested == 0 {
            f |= ZF | PF;
        }
        if bit == 7 && tested != 0 {
            f |= SF;
        }
        let xy_source = match addr {
            Some(addr) => (addr >> 8) as u8,
            None => value,
        };
        f |= xy_source & (YF | XF);
        self.f = f;
    }

    fn exec_ed(&mut self, bus: &mut impl Z80Bus) -> u32 {
        let opcode = self.fetch(bus);
        self.inc_r();
        let x = opcode >> 6;
        let y = (opcode >> 3) & 0x07;
        let z = opcode & 0x07;
        let p = y >> 1;
        let q = y & 0x01;

        if x == 1 {
            match z {
                0 => {
                    let port = self.bc();
                    let value = bus.port_in(port);
                    if y != 6 {
                        self.reg8_set(y, Prefix::None, value);
                    }
                    let mut f = (self.f & CF) | (value & (SF | YF | XF));
                    if value == 0 {
                        f |= ZF;
                    }
                    if value.count_ones() % 2 == 0 {
                        f |= PF;
                    }
                    self.f = f;
                    self.mem_ptr = port.wrapping_add(1);
                    12
                }
                1 => {
                    let port = self.bc();
                    let value = if y == 6 { 0 } else { self.reg8_get(y, Prefix::None) };
                    bus.port_out(port, value);
                    self.mem_ptr = port.wrapping_add(1);
                    12
                }
                2 => {
                    let hl = self.hl();
                    let rhs = self.rp_get(p, Prefix::None);
                    let value = if q == 0 {
                        self.sbc16(hl, rhs)
                    } else {
                        self.adc16(hl, rhs)
                    };
                    self.set_hl(value);
                    15
                }
                3 => {
                    let addr = self.fetch16(bus);
                    if q == 0 {
                        let value = self.rp_get(p, Prefix::None);
                        self.write16(bus, addr, value);
                    } else {
                        let value = self.read16(bus, addr);
                        self.rp_set(p, Prefix::None, value);
                    }
                    self.mem_ptr = addr.wrapping_add(1);
                    20
                }
                4 => {
                    // NEG: 0 - A.
                    let a = self.a;
                    self.a = 0;
                    self.a = self.sub8(a, false);
                    8
                }
                5 => {
                    // RETN and RETI both restore IFF1 from IFF2.
                    self.pc = self.pop16(bus);
                    self.mem_ptr = self.pc;
                    self.iff1 = self.iff2;
                    14
                }
                6 => {
                    self.interrupt_mode = match y & 0x03 {
                        0 | 1 => 0,
                        2 => 1,
                        _ => 2,
                    };
                    8
                }
                _ => match y {
                    0 => {
                        self.i = self.a;
                        9
                    }
                    1 => {
                        self.r = self.a;
                        9
                    }
                    2 => {
                        self.a = self.i;
                        self.ir_flags();
                        9
                    }
                    3 => {
                        self.a = self.r;
                        self.ir_flags();
                        9
                    }
                    4 => {
                        // RRD: rotate BCD digits right through (HL).
                        let addr = self.hl();
                        let value = bus.read_byte(addr);
                        let result = (self.a << 4) | (value >> 4);
                        self.a = (self.a & 0xF0) | (value & 0x0F);
                        bus.write_byte(addr, result);
                        self.digit_rotate_flags();
                        self.mem_ptr = addr.wrapping_add(1);
                        18
                    }
                    5 => {
                        // RLD: rotate BCD digits left through (HL).
                        let addr = self.hl();
                        let value = bus.read_byte(addr);
                        let result = (value << 4) | (self.a & 0x0F);
                        self.a = (self.a & 0xF0) | (value >> 4);
                        bus.write_byte(addr, result);
                        self.digit_rotate_flags();
                        self.mem_ptr = addr.wrapping_add(1);
                        18
                    }
                    _ => 8,
                },
            }
        } else if x == 2 && z <= 3 && y >= 4 {
            self.exec_block(bus, y, z)
        } else {
            // Every other ED combination is a two-byte NOP.
            8
        }
    }

    fn ir_flags(&mut self) {
        let mut f = (self.f & CF) | (self.a & (SF | YF | XF));
        if self.a == 0 {
            f |= ZF;
        }
        if self.iff2 {
            f |= PF;
        }
        self.f = f;
    }

    fn digit_rotate_flags(&mut self) {
        let mut f = (self.f & CF) | (self.a & (SF | YF | XF));
        if self.a == 0 {
            f |= ZF;
        }
        if self.a.count_ones() % 2 == 0 {
            f |= PF;
        }
        self.f = f;
    }

    /// LDI/LDD/CPI/CPD/INI/IND/OUTI/OUTD and their repeating forms.
    fn exec_block(&mut self, bus: &mut impl Z80Bus, y: u8, z: u8) -> u32 {
        let repeat = y >= 6;
        let delta: i16 = if y & 0x01 == 0 { 1 } else { -1 };

        match z {
            0 => {
                // LDI/LDD: (DE) <- (HL), advance both, BC counts down.
                let value = bus.read_byte(self.hl());
                bus.write_byte(self.de(), value);
                self.set_hl(self.hl().wrapping_add_signed(delta));
                self.set_de(self.de().wrapping_add_signed(delta));
                self.set_bc(self.bc().wrapping_sub(1));

                let n = self.a.wrapping_add(value);
                let mut f = self.f & (SF | ZF | CF);
                if self.bc() != 0 {
                    f |= PF;
                }
                if n & 0x02 != 0 {
                    f |= YF;
                }
                if n & 0x08 != 0 {
                    f |= XF;
                }
                self.f = f;

                if repeat && self.bc() != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    self.mem_ptr = self.pc.wrapping_add(1);
                    21
                } else {
                    16
                }
            }
            1 => {
                // CPI/CPD: compare A with (HL), BC counts down, C untouched.
                let value = bus.read_byte(self.hl());
                let a = self.a;
                let result = a.wrapping_sub(value);
                let half = (a ^ value ^ result) & 0x10 != 0;
                self.set_hl(self.hl().wrapping_add_signed(delta));
                self.set_bc(self.bc().wrapping_sub(1));
                self.mem_ptr = self.mem_ptr.wrapping_add_signed(delta);

                let mut f = (self.f & CF) | NF | (result & SF);
                if result == 0 {
                    f |= ZF;
                }
                if half {
                    f |= HF;
                }
                if self.bc() != 0 {
                    f |= PF;
                }
                let n = result.wrapping_sub(u8::from(half));
                if n & 0x02 != 0 {
                    f |= YF;
                }
                if n & 0x08 != 0 {
                    f |= XF;
                }
                self.f = f;

                if repeat && self.bc() != 0 && result != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    self.mem_ptr = self.pc.wrapping_add(1);
                    21
                } else {
                    16
                }
            }
            2 => {
                // INI/IND: (HL) <- port(BC), B counts down.
                let value = bus.port_in(self.bc());
                bus.write_byte(self.hl(), value);
                self.mem_ptr = self.bc().wrapping_add_signed(delta);
                self.b = self.b.wrapping_sub(1);
                self.set_hl(self.hl().wrapping_add_signed(delta));
                self.io_block_flags();

                if repeat && self.b != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    21
                } else {
                    16
                }
            }
            _ => {
                // OUTI/OUTD: port(BC) <- (HL) after B counts down.
                let value = bus.read_byte(self.hl());
                self.b = self.b.wrapping_sub(1);
                bus.port_out(self.bc(), value);
                self.mem_ptr = self.bc().wrapping_add_signed(delta);
                self.set_hl(self.hl().wrapping_add_signed(delta));
                self.io_block_flags();

                if repeat && self.b != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    21
                } else {
                    16
                }
            }
        }
    }

    /// Simplified IN/OUT block flags: Z and S from B, N set.
    fn io_block_flags(&mut self) {
        let mut f = (self.f & CF) | NF | (self.b & (SF | YF | XF));
        if self.b == 0 {
            f |= ZF;
        }
        self.f = f;
    }
}

impl Default for Z80 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat 64 KiB RAM with latched IO for exercising the core.
    struct TestBus {
        mem: Vec<u8>,
        last_out: Option<(u16, u8)>,
        in_value: u8,
    }

    impl TestBus {
        fn new(program: &[u8]) -> Self {
            let mut mem = vec![0u8; 0x10000];
            mem[..program.len()].copy_from_slice(program);
            Self { mem, last_out: None, in_value: 0xA5 }
        }
    }

    impl Z80Bus for TestBus {
        fn read_byte(&mut self, addr: u16) -> u8 {
            self.mem[usize::from(addr)]
        }

        fn write_byte(&mut self, addr: u16, data: u8) {
            self.mem[usize::from(addr)] = data;
        }

        fn port_in(&mut self, _port: u16) -> u8 {
            self.in_value
        }

        fn port_out(&mut self, port: u16, data: u8) {
            self.last_out = Some((port, data));
        }
    }

    fn run(program: &[u8], steps: usize) -> (Z80, TestBus) {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(program);
        for _ in 0..steps {
            cpu.step(&mut bus);
        }
        (cpu, bus)
    }

    #[test]
    fn loads_immediates_and_moves_registers() {
        // LD A,0x42; LD B,A; LD C,B; LD HL,0x1234
        let (cpu, _) = run(&[0x3E, 0x42, 0x47, 0x48, 0x21, 0x34, 0x12], 4);
        assert_eq!(cpu.a, 0x42);
        assert_eq!(cpu.b, 0x42);
        assert_eq!(cpu.c, 0x42);
        assert_eq!(cpu.hl(), 0x1234);
    }

    #[test]
    fn memory_loads_and_stores_through_hl() {
        // LD HL,0x8000; LD (HL),0x99; LD A,(HL); INC (HL)
        let (cpu, bus) = run(&[0x21, 0x00, 0x80, 0x36, 0x99, 0x7E, 0x34], 4);
        assert_eq!(cpu.a, 0x99);
        assert_eq!(bus.mem[0x8000], 0x9A);
    }

    #[test]
    fn add_sets_carry_and_overflow() {
        // LD A,0x7F; ADD A,0x01 -> 0x80, overflow, no carry
        let (cpu, _) = run(&[0x3E, 0x7F, 0xC6, 0x01], 2);
        assert_eq!(cpu.a, 0x80);
        assert_ne!(cpu.f & PF, 0, "overflow");
        assert_ne!(cpu.f & SF, 0, "sign");
        assert_eq!(cpu.f & CF, 0, "carry");
        assert_ne!(cpu.f & HF, 0, "half carry");

        // LD A,0xFF; ADD A,0x01 -> 0x00, carry, zero
        let (cpu, _) = run(&[0x3E, 0xFF, 0xC6, 0x01], 2);
        assert_eq!(cpu.a, 0x00);
        assert_ne!(cpu.f & ZF, 0);
        assert_ne!(cpu.f & CF, 0);
        assert_eq!(cpu.f & PF, 0);
    }

    #[test]
    fn sub_and_compare_flags() {
        // LD A,0x10; SUB 0x20 -> 0xF0, carry, sign, N
        let (cpu, _) = run(&[0x3E, 0x10, 0xD6, 0x20], 2);
        assert_eq!(cpu.a, 0xF0);
        assert_ne!(cpu.f & CF, 0);
        assert_ne!(cpu.f & SF, 0);
        assert_ne!(cpu.f & NF, 0);

        // LD A,0x42; CP 0x42 -> Z set, A unchanged
        let (cpu, _) = run(&[0x3E, 0x42, 0xFE, 0x42], 2);
        assert_eq!(cpu.a, 0x42);
        assert_ne!(cpu.f & ZF, 0);
    }

    #[test]
    fn inc_dec_preserve_carry() {
        // SCF; INC B; DEC B
        let (cpu, _) = run(&[0x37, 0x04, 0x05], 3);
        assert_ne!(cpu.f & CF, 0, "INC/DEC must not clobber carry");
        assert_ne!(cpu.f & ZF, 0, "B wrapped back to zero");
    }

    #[test]
    fn stack_round_trips_and_calls() {
        // LD SP,0xF000; LD BC,0xBEEF; PUSH BC; POP DE; CALL 0x0100
        let program = [0x31, 0x00, 0xF0, 0x01, 0xEF, 0xBE, 0xC5, 0xD1, 0xCD, 0x00, 0x01];
        let (cpu, bus) = run(&program, 5);
        assert_eq!(cpu.de(), 0xBEEF);
        assert_eq!(cpu.pc, 0x0100);
        assert_eq!(cpu.sp, 0xEFFE);
        // Return address (0x000B) sits on the stack.
        assert_eq!(bus.mem[0xEFFE], 0x0B);
        assert_eq!(bus.mem[0xEFFF], 0x00);
    }

    #[test]
    fn ret_returns_to_caller() {
        // LD SP,0xF000; CALL 0x0008; NOP; NOP; (at 8) RET
        let program = [0x31, 0x00, 0xF0, 0xCD, 0x08, 0x00, 0x00, 0x00, 0xC9];
        let (cpu, _) = run(&program, 3);
        assert_eq!(cpu.pc, 0x0006, "back at the instruction after CALL");
    }

    #[test]
    fn djnz_counts_down() {
        // LD B,3; loop: DJNZ loop
        let (cpu, _) = run(&[0x06, 0x03, 0x10, 0xFE], 4);
        assert_eq!(cpu.b, 0);
        assert_eq!(cpu.pc, 4);
    }

    #[test]
    fn conditional_jumps_follow_flags() {
        // LD A,0x00; OR A; JP Z,0x0010
        let (cpu, _) = run(&[0x3E, 0x00, 0xB7, 0xCA, 0x10, 0x00], 3);
        assert_eq!(cpu.pc, 0x0010);

        // LD A,0x01; OR A; JP Z,0x0010 (not taken)
        let (cpu, _) = run(&[0x3E, 0x01, 0xB7, 0xCA, 0x10, 0x00], 3);
        assert_eq!(cpu.pc, 0x0006);
    }

    #[test]
    fn relative_jumps() {
        // JR 0x02 skips two bytes
        let (cpu, _) = run(&[0x18, 0x02, 0x00, 0x00], 1);
        assert_eq!(cpu.pc, 0x0004);

        // LD A,1; OR A; JR NZ,-5 -> back to 0
        let (cpu, _) = run(&[0x3E, 0x01, 0xB7, 0x20, 0xFB], 3);
        assert_eq!(cpu.pc, 0x0000);
    }

    #[test]
    fn exchange_instructions() {
        // LD HL,0x1111; LD DE,0x2222; EX DE,HL; EXX
        let (cpu, _) = run(&[0x21, 0x11, 0x11, 0x11, 0x22, 0x22, 0xEB, 0xD9], 4);
        // EX DE,HL first: HL=0x2222, DE=0x1111; EXX banks those away.
        assert_eq!(cpu.h_, 0x22);
        assert_eq!(cpu.l_, 0x22);
        assert_eq!(cpu.d_, 0x11);
        assert_eq!(cpu.e_, 0x11);
        assert_eq!(cpu.de(), 0);
        assert_eq!(cpu.hl(), 0);
    }

    #[test]
    fn cb_bit_set_res() {
        // LD B,0x00; SET 3,B; BIT 3,B; RES 3,B
        let program = [0x06, 0x00, 0xCB, 0xD8, 0xCB, 0x58, 0xCB, 0x98];
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&program);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.b, 0x08);
        cpu.step(&mut bus);
        assert_eq!(cpu.f & ZF, 0, "bit 3 is set");
        cpu.step(&mut bus);
        assert_eq!(cpu.b, 0x00);
    }

    #[test]
    fn cb_rotates() {
        // LD A,0x81; RLCA -> 0x03 with carry
        let (cpu, _) = run(&[0x3E, 0x81, 0x07], 2);
        assert_eq!(cpu.a, 0x03);
        assert_ne!(cpu.f & CF, 0);

        // LD B,0x01; RRC B -> 0x80, carry set
        let (cpu, _) = run(&[0x06, 0x01, 0xCB, 0x08], 2);
        assert_eq!(cpu.b, 0x80);
        assert_ne!(cpu.f & CF, 0);
    }

    #[test]
    fn ldir_copies_blocks() {
        // LD HL,0x0100; LD DE,0x0200; LD BC,3; LDIR
        let mut program = vec![0x21, 0x00, 0x01, 0x11, 0x00, 0x02, 0x01, 0x03, 0x00, 0xED, 0xB0];
        program.resize(0x103, 0);
        program[0x100] = 0xAA;
        program[0x101] = 0xBB;
        program[0x102] = 0xCC;
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&program);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        // LDIR repeats in place until BC hits zero.
        let mut guard = 0;
        while cpu.bc() != 0 && guard < 10 {
            cpu.step(&mut bus);
            guard += 1;
        }
        assert_eq!(&bus.mem[0x200..0x203], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(cpu.hl(), 0x103);
        assert_eq!(cpu.de(), 0x203);
        assert_eq!(cpu.f & PF, 0, "BC reached zero");
    }

    #[test]
    fn daa_adjusts_bcd_addition() {
        // LD A,0x15; ADD A,0x27; DAA -> 0x42
        let (cpu, _) = run(&[0x3E, 0x15, 0xC6, 0x27, 0x27], 3);
        assert_eq!(cpu.a, 0x42);
    }

    #[test]
    fn indexed_loads_use_displacement() {
        // LD IX,0x8000; LD (IX+5),0x77; LD A,(IX+5)
        let program = [
            0xDD, 0x21, 0x00, 0x80, // LD IX,0x8000
            0xDD, 0x36, 0x05, 0x77, // LD (IX+5),0x77
            0xDD, 0x7E, 0x05, // LD A,(IX+5)
        ];
        let (cpu, bus) = run(&program, 3);
        assert_eq!(bus.mem[0x8005], 0x77);
        assert_eq!(cpu.a, 0x77);
        assert_eq!(cpu.ix, 0x8000);
    }

    #[test]
    fn indexed_negative_displacement() {
        // LD IY,0x8010; LD (IY-8),0x12
        let program = [0xFD, 0x21, 0x10, 0x80, 0xFD, 0x36, 0xF8, 0x12];
        let (_, bus) = run(&program, 2);
        assert_eq!(bus.mem[0x8008], 0x12);
    }

    #[test]
    fn ddcb_operates_on_memory_and_copies_to_register() {
        // LD IX,0x8000; SET 0,(IX+1),B (DDCB d C0|r)
        let program = [0xDD, 0x21, 0x00, 0x80, 0xDD, 0xCB, 0x01, 0xC0];
        let (cpu, bus) = run(&program, 2);
        assert_eq!(bus.mem[0x8001], 0x01);
        assert_eq!(cpu.b, 0x01);
    }

    #[test]
    fn io_ports_round_trip() {
        // LD A,0x5A; OUT (0x34),A; IN A,(0x20)
        let (cpu, bus) = run(&[0x3E, 0x5A, 0xD3, 0x34, 0xDB, 0x20], 3);
        assert_eq!(bus.last_out, Some((0x5A34, 0x5A)));
        assert_eq!(cpu.a, 0xA5);
    }

    #[test]
    fn halt_freezes_pc_and_burns_cycles() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x76]);
        cpu.step(&mut bus);
        assert!(cpu.halted);
        let pc = cpu.pc;
        assert_eq!(cpu.step(&mut bus), 4);
        assert_eq!(cpu.pc, pc);
    }

    #[test]
    fn nmi_jumps_to_0x66_and_wakes_halt() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x31, 0x00, 0xF0, 0x76]); // LD SP,0xF000; HALT
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert!(cpu.halted);
        cpu.pulse_nmi();
        let cyc = cpu.step(&mut bus);
        assert_eq!(cyc, 11);
        assert_eq!(cpu.pc, 0x0066);
        assert!(!cpu.halted);
        assert!(!cpu.iff1);
    }

    #[test]
    fn irq_in_mode_1_vectors_to_0x38() {
        // LD SP,0xF000; IM 1; EI; NOP; NOP
        let program = [0x31, 0x00, 0xF0, 0xED, 0x56, 0xFB, 0x00, 0x00];
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&program);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        cpu.pulse_irq(0xFF);
        // The instruction after EI still runs before the IRQ is accepted.
        cpu.step(&mut bus);
        assert_ne!(cpu.pc, 0x0038);
        let cyc = cpu.step(&mut bus);
        assert_eq!(cyc, 13);
        assert_eq!(cpu.pc, 0x0038);
        assert!(!cpu.iff1);
    }

    #[test]
    fn masked_irq_stays_pending() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x00, 0x00, 0x00]);
        cpu.pulse_irq(0xFF);
        cpu.step(&mut bus);
        assert!(cpu.irq_pending, "IFF1 clear, IRQ must wait");
        assert_ne!(cpu.pc, 0x0038);
    }

    #[test]
    fn delay_is_added_to_next_step() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x00, 0x00]);
        let base = cpu.step(&mut bus);
        assert_eq!(base, 4);
        cpu.delay(48);
        assert_eq!(cpu.step(&mut bus), 52);
    }

    #[test]
    fn step_n_runs_at_least_requested_cycles() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x00; 64]);
        let consumed = cpu.step_n(&mut bus, 30);
        assert!(consumed >= 30);
        assert_eq!(consumed % 4, 0, "NOPs are 4 cycles each");
    }

    #[test]
    fn add_hl_updates_carry_only_flags() {
        // LD HL,0xFFFF; LD BC,0x0001; ADD HL,BC
        let (cpu, _) = run(&[0x21, 0xFF, 0xFF, 0x01, 0x01, 0x00, 0x09], 3);
        assert_eq!(cpu.hl(), 0x0000);
        assert_ne!(cpu.f & CF, 0);
        assert_eq!(cpu.f & NF, 0);
    }

    #[test]
    fn sixteen_bit_loads_to_memory() {
        // LD HL,0xCAFE; LD (0x9000),HL; LD DE,(0x9000) via ED 5B
        let program = [
            0x21, 0xFE, 0xCA, // LD HL,0xCAFE
            0x22, 0x00, 0x90, // LD (0x9000),HL
            0xED, 0x5B, 0x00, 0x90, // LD DE,(0x9000)
        ];
        let (cpu, bus) = run(&program, 3);
        assert_eq!(bus.mem[0x9000], 0xFE);
        assert_eq!(bus.mem[0x9001], 0xCA);
        assert_eq!(cpu.de(), 0xCAFE);
    }

    #[test]
    fn neg_negates_accumulator() {
        // LD A,0x01; NEG
        let (cpu, _) = run(&[0x3E, 0x01, 0xED, 0x44], 2);
        assert_eq!(cpu.a, 0xFF);
        assert_ne!(cpu.f & CF, 0);
        assert_ne!(cpu.f & NF, 0);
    }
}
