//! Just-in-time code generation for the refresh-synchronized hammer loop.
//!
//! [`CodeJitter`] holds the (persisted) codegen parameters and emits a
//! nullary `extern "C"` function over a mapped address sequence. The
//! function synchronizes with the DRAM refresh via timing probes on two
//! spare same-bank rows, hammers the sequence with explicit cacheline
//! flushes and fences, and returns the number of probe accesses it needed
//! to hit the final refresh boundary.

mod asm;

pub use asm::{AsmError, Assembler, Label};

use crate::params::{FencingStrategy, FlushingStrategy, FuzzingParameterSet, HammeringStrategy};
use log::debug;
use serde::{Deserialize, Serialize};
use sledge_core::memory::AggressorPtr;
use sledge_core::util::{mmap_code, munmap, protect_exec};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Cycle count separating a refresh-delayed access from an ordinary one.
const SYNC_THRESHOLD_CYCLES: u32 = 1000;

/// Errors during code emission. All of these indicate a programming bug or
/// an unusable environment; the orchestrator treats them as fatal.
#[derive(Debug, Error)]
pub enum JitError {
    /// The mapped address sequence is empty.
    #[error("cannot jit an empty address sequence")]
    EmptySequence,
    /// Synchronization was requested with fewer than two probe rows.
    #[error("hammering requires at least 2 sync rows, got {0}")]
    TooFewSyncRows(usize),
    /// The encoder could not finalize the instruction stream.
    #[error(transparent)]
    Encode(#[from] AsmError),
    /// Mapping or protecting the code pages failed.
    #[error("failed to map code pages: {0}")]
    CodePages(#[from] std::io::Error),
}

/// An emitted, executable hammer function.
///
/// Owns its code pages; dropping the program unmaps them, so releasing
/// before the next emission keeps the code-page footprint flat.
pub struct Program {
    code: *mut u8,
    len: usize,
}

impl Program {
    fn from_code(bytes: &[u8]) -> Result<Self, JitError> {
        let code = mmap_code(bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), code, bytes.len());
            protect_exec(code, bytes.len())?;
        }
        Ok(Program {
            code,
            len: bytes.len(),
        })
    }

    /// Size of the emitted code in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the program contains no code. Always false for programs
    /// produced by [`CodeJitter::jit`].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the emitted machine code.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.code, self.len) }
    }

    /// Runs the hammer function and returns its probe count.
    ///
    /// # Safety
    ///
    /// The addresses baked into the program must still be mapped and
    /// readable. The call blocks for the whole hammer run.
    pub unsafe fn call(&self) -> u32 {
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(self.code) };
        f()
    }

    /// Dumps the emitted code to a file for offline disassembly.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let mut f = File::create(path)?;
        f.write_all(self.code())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        unsafe { munmap(self.code, self.len) };
    }
}

/// Code generation parameters for one mapping's hammer function.
///
/// Persisted alongside the mapping so that a replay run can re-emit
/// byte-equivalent code.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CodeJitter {
    /// Cacheline flush placement
    pub flushing_strategy: FlushingStrategy,
    /// Memory fence placement
    pub fencing_strategy: FencingStrategy,
    /// Codegen variant
    pub hammering_strategy: HammeringStrategy,
    /// Outer loop count: refresh intervals per hammer call
    pub num_refresh_intervals: usize,
    /// Repetitions of the address sequence per refresh interval
    pub agg_rounds: usize,
    /// Number of sync probe rows; 0 disables refresh synchronization
    pub num_aggs_for_sync: usize,
    /// Re-synchronize after every refresh interval instead of only after
    /// the last one
    pub sync_each_ref: bool,
}

impl CodeJitter {
    /// Derives the jitter configuration from a parameter set.
    pub fn new(params: &FuzzingParameterSet) -> Self {
        CodeJitter {
            flushing_strategy: params.flushing_strategy,
            fencing_strategy: params.fencing_strategy,
            hammering_strategy: params.hammering_strategy,
            num_refresh_intervals: params.num_refresh_intervals,
            agg_rounds: params.agg_rounds,
            num_aggs_for_sync: 2,
            sync_each_ref: params.sync_each_ref,
        }
    }

    /// Total memory accesses the emitted hammer phase performs.
    pub fn expected_activations(&self, sequence_len: usize) -> usize {
        self.agg_rounds * sequence_len * self.num_refresh_intervals
    }

    /// Emits the hammer function for `addresses`, synchronized on
    /// `sync_rows`.
    ///
    /// # Errors
    ///
    /// Fails on an empty sequence, on fewer than [`num_aggs_for_sync`]
    /// sync rows, or if the code pages cannot be mapped. All are fatal to
    /// the fuzzing iteration.
    ///
    /// [`num_aggs_for_sync`]: CodeJitter::num_aggs_for_sync
    pub fn jit(
        &self,
        addresses: &[AggressorPtr],
        sync_rows: &[AggressorPtr],
    ) -> Result<Program, JitError> {
        if addresses.is_empty() {
            return Err(JitError::EmptySequence);
        }
        if sync_rows.len() < self.num_aggs_for_sync {
            return Err(JitError::TooFewSyncRows(sync_rows.len()));
        }
        let sync_rows = &sync_rows[..self.num_aggs_for_sync];
        let sync = !sync_rows.is_empty();

        let mut a = Assembler::new();

        // rbx is callee-saved in the SysV ABI but serves as access scratch
        a.push_rbx();

        // ------- part 1: synchronize with the beginning of an interval ----
        if sync {
            // touch the probe rows once to open their rows
            for &row in sync_rows {
                a.mov_rax_imm64(row as u64);
                a.load_rbx_from_rax();
            }
            self.emit_sync(&mut a, sync_rows, false);
        }

        // ------- part 2: hammer, then re-detect the refresh ---------------
        a.mov_rsi_imm64(self.num_refresh_intervals as u64);
        a.mov_edx_imm32(0);

        let for_begin = a.new_label();
        let for_end = a.new_label();
        a.bind(for_begin);
        a.cmp_rsi_imm8(0);
        a.jz(for_end);
        a.dec_rsi();

        // agg_rounds is small, unroll instead of paying for another loop
        for _ in 0..self.agg_rounds {
            match self.hammering_strategy {
                HammeringStrategy::Original => self.emit_round_original(&mut a, addresses),
                HammeringStrategy::Strict => self.emit_round_strict(&mut a, addresses),
            }
        }

        if sync && self.sync_each_ref {
            self.emit_sync(&mut a, sync_rows, true);
        }
        a.jmp(for_begin);
        a.bind(for_end);
        if sync && !self.sync_each_ref {
            self.emit_sync(&mut a, sync_rows, true);
        }

        // ------- part 3: return the probe count ---------------------------
        a.mov_eax_edx();
        a.pop_rbx();
        a.ret();

        let code = a.finalize()?;
        debug!(
            "jitted {} bytes for {} addresses ({} rounds, {} intervals)",
            code.len(),
            addresses.len(),
            self.agg_rounds,
            self.num_refresh_intervals
        );
        Program::from_code(&code)
    }

    /// One hammer round with strategy-placed flushes and fences.
    fn emit_round_original(&self, a: &mut Assembler, addresses: &[AggressorPtr]) {
        match self.flushing_strategy {
            FlushingStrategy::EarliestPossible => {
                for &addr in addresses {
                    a.mov_rax_imm64(addr as u64);
                    a.load_rbx_from_rax();
                    a.clflushopt_rax();
                    if self.fencing_strategy == FencingStrategy::EarliestPossible {
                        a.mfence();
                    }
                }
            }
            FlushingStrategy::LatestPossible => {
                for &addr in addresses {
                    a.mov_rax_imm64(addr as u64);
                    a.load_rbx_from_rax();
                }
                for &addr in addresses {
                    a.mov_rax_imm64(addr as u64);
                    a.clflushopt_rax();
                    if self.fencing_strategy == FencingStrategy::EarliestPossible {
                        a.mfence();
                    }
                }
            }
        }
        if self.fencing_strategy == FencingStrategy::LatestPossible {
            a.mfence();
        }
    }

    /// One strictly interleaved hammer round: access, flush, fence per
    /// address, no reordering freedom.
    fn emit_round_strict(&self, a: &mut Assembler, addresses: &[AggressorPtr]) {
        for &addr in addresses {
            a.mov_rax_imm64(addr as u64);
            a.load_rbx_from_rax();
            a.clflushopt_rax();
            a.mfence();
        }
    }

    /// Emits the refresh-detection loop over the probe rows.
    ///
    /// When `counting`, every probe access increments `edx`; `edx` is
    /// preserved across `rdtscp` (which clobbers it) with push/pop.
    fn emit_sync(&self, a: &mut Assembler, sync_rows: &[AggressorPtr], counting: bool) {
        let loop_begin = a.new_label();
        let loop_end = a.new_label();
        a.bind(loop_begin);

        for &row in sync_rows {
            a.mov_rax_imm64(row as u64);
            a.clflushopt_rax();
        }
        a.mfence();
        if counting {
            a.lfence();
            a.push_rdx();
        }
        a.rdtscp();
        a.lfence();
        a.mov_ebx_eax();
        if counting {
            a.pop_rdx();
        }

        for &row in sync_rows {
            a.mov_rax_imm64(row as u64);
            if counting {
                a.load_rax_from_rax();
                a.inc_edx();
            } else {
                a.load_rcx_from_rax();
            }
        }

        if counting {
            a.push_rdx();
        }
        a.rdtscp();
        if counting {
            a.lfence();
            a.pop_rdx();
        }
        // exit once the probe pair took refresh-length time
        a.sub_eax_ebx();
        a.cmp_eax_imm32(SYNC_THRESHOLD_CYCLES);
        a.jg(loop_end);
        a.jmp(loop_begin);
        a.bind(loop_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{FencingStrategy, FlushingStrategy, HammeringStrategy};
    use sledge_core::memory::{BytePointer, Memory};
    use sledge_core::util::CL_SIZE;

    fn jitter(
        strategy: HammeringStrategy,
        intervals: usize,
        rounds: usize,
        sync: bool,
    ) -> CodeJitter {
        CodeJitter {
            flushing_strategy: FlushingStrategy::EarliestPossible,
            fencing_strategy: FencingStrategy::LatestPossible,
            hammering_strategy: strategy,
            num_refresh_intervals: intervals,
            agg_rounds: rounds,
            num_aggs_for_sync: if sync { 2 } else { 0 },
            sync_each_ref: true,
        }
    }

    fn count_opcode(code: &[u8], needle: &[u8]) -> usize {
        code.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn test_emitted_access_count_matches_product() {
        let addrs: Vec<AggressorPtr> = (0..7).map(|i| (0x1000 + i * CL_SIZE) as AggressorPtr).collect();
        for strategy in [HammeringStrategy::Original, HammeringStrategy::Strict] {
            let j = jitter(strategy, 4, 3, false);
            let program = j.jit(&addrs, &[]).expect("jit");
            // `mov rbx, [rax]` is used exclusively for hammer accesses; the
            // loop body is unrolled per round but iterated per interval
            let per_interval = count_opcode(program.code(), &[0x48, 0x8B, 0x18]);
            assert_eq!(per_interval * 4, j.expected_activations(addrs.len()));
            // every access has a matching clflushopt
            assert_eq!(
                count_opcode(program.code(), &[0x66, 0x0F, 0xAE, 0x38]),
                per_interval
            );
        }
    }

    #[test]
    fn test_program_ends_with_ret() {
        let addrs = [0x2000 as AggressorPtr];
        let j = jitter(HammeringStrategy::Original, 1, 1, false);
        let program = j.jit(&addrs, &[]).expect("jit");
        assert_eq!(*program.code().last().unwrap(), 0xC3);
    }

    #[test]
    fn test_sync_blocks_present() {
        let addrs = [0x2000 as AggressorPtr];
        let sync = [0x3000 as AggressorPtr, 0x4000 as AggressorPtr];
        let j = jitter(HammeringStrategy::Original, 1, 1, true);
        let program = j.jit(&addrs, &sync).expect("jit");
        // pre-sync and post-sync both carry a rdtscp pair
        assert_eq!(count_opcode(program.code(), &[0x0F, 0x01, 0xF9]), 4);
        // probe counting uses `inc edx` for each of the two probes
        assert_eq!(count_opcode(program.code(), &[0xFF, 0xC2]), 2);
    }

    #[test]
    fn test_too_few_sync_rows() {
        let addrs = [0x2000 as AggressorPtr];
        let j = jitter(HammeringStrategy::Original, 1, 1, true);
        assert!(matches!(
            j.jit(&addrs, &[0x3000 as AggressorPtr]),
            Err(JitError::TooFewSyncRows(1))
        ));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let j = jitter(HammeringStrategy::Original, 1, 1, false);
        assert!(matches!(j.jit(&[], &[]), Err(JitError::EmptySequence)));
    }

    #[test]
    fn test_execute_without_sync() {
        // executing the jitted loop over plain mapped memory exercises the
        // encoder end to end; without sync rows the probe counter stays 0
        let mem = Memory::mmap(1 << 16).expect("mmap");
        let addrs: Vec<AggressorPtr> = (0..16)
            .map(|i| mem.addr(i * CL_SIZE) as AggressorPtr)
            .collect();
        for strategy in [HammeringStrategy::Original, HammeringStrategy::Strict] {
            for fencing in [
                FencingStrategy::EarliestPossible,
                FencingStrategy::LatestPossible,
            ] {
                for flushing in [
                    FlushingStrategy::EarliestPossible,
                    FlushingStrategy::LatestPossible,
                ] {
                    let j = CodeJitter {
                        flushing_strategy: flushing,
                        fencing_strategy: fencing,
                        hammering_strategy: strategy,
                        num_refresh_intervals: 8,
                        agg_rounds: 2,
                        num_aggs_for_sync: 0,
                        sync_each_ref: true,
                    };
                    let program = j.jit(&addrs, &[]).expect("jit");
                    let probes = unsafe { program.call() };
                    assert_eq!(probes, 0);
                }
            }
        }
        mem.dealloc();
    }

    #[test]
    fn test_release_does_not_leak_mappings() {
        // a thousand emit/release cycles must stay at a flat code-page
        // footprint; Drop unmaps and asserts on munmap failure
        let addrs = [0x2000 as AggressorPtr, 0x2040 as AggressorPtr];
        let j = jitter(HammeringStrategy::Original, 2, 2, false);
        for _ in 0..1000 {
            let program = j.jit(&addrs, &[]).expect("jit");
            assert!(!program.is_empty());
            drop(program);
        }
    }

    #[test]
    fn test_program_write_dump() {
        let addrs = [0x2000 as AggressorPtr];
        let j = jitter(HammeringStrategy::Strict, 1, 1, false);
        let program = j.jit(&addrs, &[]).expect("jit");
        let path = std::env::temp_dir().join("sledge_jit_dump.bin");
        program.write(&path).expect("write");
        let on_disk = std::fs::read(&path).expect("read back");
        assert_eq!(on_disk, program.code());
        std::fs::remove_file(path).ok();
    }
}
