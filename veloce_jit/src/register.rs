//! General purpose and SSE registers, and the per-method register pool.

use crate::error::Error::RegisterPoolExhausted;
use crate::error::Result;

/// x86-64 general purpose registers with their hardware encodings.
///
/// RSP and RBP are frame registers and never allocated. RAX is the reserved scratch register for
/// division, call targets, and the return status, and is likewise kept out of the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub(crate) fn encoding(self) -> u8 {
        self as u8
    }

    /// Whether an 8-bit store can address this register without a REX prefix. Only the four
    /// legacy registers qualify; SPL/BPL/SIL/DIL forms are avoided entirely.
    pub(crate) fn is_byte_addressable(self) -> bool {
        matches!(self, Gpr::Rax | Gpr::Rbx | Gpr::Rcx | Gpr::Rdx)
    }
}

/// SSE registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    pub(crate) fn encoding(self) -> u8 {
        self as u8
    }
}

/// Free lists of general purpose and SSE registers for one method compilation.
///
/// The pool itself never spills; when it runs dry the translator spills the oldest working-stack
/// entry into the red zone and retries.
#[derive(Debug)]
pub(crate) struct RegisterPool {
    general: Vec<Gpr>,
    simd: Vec<Xmm>,
}

impl RegisterPool {
    pub(crate) fn new() -> Self {
        RegisterPool {
            general: vec![
                Gpr::Rbx,
                Gpr::Rcx,
                Gpr::Rdx,
                Gpr::Rsi,
                Gpr::Rdi,
                Gpr::R8,
                Gpr::R9,
                Gpr::R10,
                Gpr::R11,
                Gpr::R12,
                Gpr::R13,
                Gpr::R14,
                Gpr::R15,
            ],
            simd: vec![
                Xmm::Xmm0,
                Xmm::Xmm1,
                Xmm::Xmm2,
                Xmm::Xmm3,
                Xmm::Xmm4,
                Xmm::Xmm5,
                Xmm::Xmm6,
                Xmm::Xmm7,
                Xmm::Xmm8,
                Xmm::Xmm9,
                Xmm::Xmm10,
                Xmm::Xmm11,
                Xmm::Xmm12,
                Xmm::Xmm13,
                Xmm::Xmm14,
                Xmm::Xmm15,
            ],
        }
    }

    /// Acquires any free general purpose register.
    pub(crate) fn acquire(&mut self) -> Result<Gpr> {
        self.general.pop().ok_or(RegisterPoolExhausted)
    }

    /// Acquires a free register legal as an 8-bit store operand.
    pub(crate) fn acquire_byte_addressable(&mut self) -> Result<Gpr> {
        let position = self
            .general
            .iter()
            .rposition(|register| register.is_byte_addressable())
            .ok_or(RegisterPoolExhausted)?;
        Ok(self.general.remove(position))
    }

    pub(crate) fn release(&mut self, register: Gpr) {
        debug_assert!(!self.general.contains(&register), "double release");
        self.general.push(register);
    }

    /// Acquires any free SSE register.
    pub(crate) fn acquire_xmm(&mut self) -> Result<Xmm> {
        self.simd.pop().ok_or(RegisterPoolExhausted)
    }

    pub(crate) fn release_xmm(&mut self, register: Xmm) {
        debug_assert!(!self.simd.contains(&register), "double release");
        self.simd.push(register);
    }

    pub(crate) fn available(&self) -> usize {
        self.general.len()
    }

    pub(crate) fn available_xmm(&self) -> usize {
        self.simd.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;

    #[test]
    fn test_acquire_release() -> Result<()> {
        let mut pool = RegisterPool::new();
        let total = pool.available();
        let register = pool.acquire()?;
        assert_eq!(total - 1, pool.available());
        pool.release(register);
        assert_eq!(total, pool.available());
        Ok(())
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = RegisterPool::new();
        while pool.available() > 0 {
            let _ = pool.acquire();
        }
        assert_eq!(Err(Error::RegisterPoolExhausted), pool.acquire());
    }

    #[test]
    fn test_byte_addressable_restriction() -> Result<()> {
        let mut pool = RegisterPool::new();
        let register = pool.acquire_byte_addressable()?;
        assert!(register.is_byte_addressable());
        assert!(!Gpr::Rsi.is_byte_addressable());
        assert!(!Gpr::R8.is_byte_addressable());
        Ok(())
    }

    #[test]
    fn test_xmm_pool() -> Result<()> {
        let mut pool = RegisterPool::new();
        let total = pool.available_xmm();
        let register = pool.acquire_xmm()?;
        assert_eq!(total - 1, pool.available_xmm());
        pool.release_xmm(register);
        assert_eq!(total, pool.available_xmm());
        Ok(())
    }
}
