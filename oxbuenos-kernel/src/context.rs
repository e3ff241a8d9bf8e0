use core::ops::{Index, IndexMut};
use num_enum::IntoPrimitive;

/// MIPS32 general purpose registers, numbered as in the ISA
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
pub enum MipsRegister {
    Zero = 0,
    At = 1,
    V0 = 2,
    V1 = 3,
    A0 = 4,
    A1 = 5,
    A2 = 6,
    A3 = 7,
    T0 = 8,
    T1 = 9,
    T2 = 10,
    T3 = 11,
    T4 = 12,
    T5 = 13,
    T6 = 14,
    T7 = 15,
    S0 = 16,
    S1 = 17,
    S2 = 18,
    S3 = 19,
    S4 = 20,
    S5 = 21,
    S6 = 22,
    S7 = 23,
    T8 = 24,
    T9 = 25,
    K0 = 26,
    K1 = 27,
    Gp = 28,
    Sp = 29,
    Fp = 30,
    Ra = 31,
}

/// Register file of a user thread, saved on every trap into the kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserContext {
    pub cpu_regs: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub pc: u32,
    /// Handled by the user-mode entry code
    pub status: u32,
}

impl UserContext {
    /// A zeroed context that starts executing at `entry_point` with the stack at `stack_top`
    #[must_use]
    pub fn new(entry_point: u32, stack_top: u32) -> Self {
        let mut context = Self::default();
        context[MipsRegister::Sp] = stack_top;
        context.pc = entry_point;
        context
    }
}

impl Index<MipsRegister> for UserContext {
    type Output = u32;

    fn index(&self, register: MipsRegister) -> &u32 {
        &self.cpu_regs[usize::from(register)]
    }
}

impl IndexMut<MipsRegister> for UserContext {
    fn index_mut(&mut self, register: MipsRegister) -> &mut u32 {
        &mut self.cpu_regs[usize::from(register)]
    }
}
