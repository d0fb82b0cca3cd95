//! Property-based tests for seccomp filter compilation
//!
//! **Property: Program Shape Invariant**
//! *For any* syscall denylist of up to 255 entries, the compiled program
//! SHALL consist of one load instruction, one compare per blocked syscall,
//! and an ALLOW-then-KILL tail, with every true-jump landing exactly on
//! the KILL instruction.

use cordon::sandbox::{SeccompProgram, SECCOMP_RET_ALLOW, SECCOMP_RET_KILL};
use proptest::prelude::*;

const OP_LOAD: u16 = 0x20;
const OP_JEQ: u16 = 0x15;
const OP_RET: u16 = 0x06;

fn arb_denylist() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0u32..=450, 0..=255)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Byte length is always `(3 + len) * 8`
    #[test]
    fn prop_output_length(blocked in arb_denylist()) {
        let program = SeccompProgram::compile(&blocked).unwrap();
        prop_assert_eq!(program.len(), blocked.len() + 3);
        prop_assert_eq!(program.to_bytes().len(), (3 + blocked.len()) * 8);
    }

    /// Instruction opcodes follow the fixed shape
    #[test]
    fn prop_instruction_shape(blocked in arb_denylist()) {
        let program = SeccompProgram::compile(&blocked).unwrap();
        let insns = program.instructions();

        prop_assert_eq!(insns[0].opcode, OP_LOAD);
        prop_assert_eq!(insns[0].k, 0);

        for (i, nr) in blocked.iter().enumerate() {
            prop_assert_eq!(insns[1 + i].opcode, OP_JEQ);
            prop_assert_eq!(insns[1 + i].k, *nr);
            prop_assert_eq!(insns[1 + i].jf, 0);
        }

        let allow = insns[insns.len() - 2];
        let kill = insns[insns.len() - 1];
        prop_assert_eq!(allow.opcode, OP_RET);
        prop_assert_eq!(allow.k, SECCOMP_RET_ALLOW);
        prop_assert_eq!(kill.opcode, OP_RET);
        prop_assert_eq!(kill.k, SECCOMP_RET_KILL);
    }

    /// Every compare's true-jump lands exactly on the KILL instruction
    #[test]
    fn prop_jumps_target_kill(blocked in arb_denylist()) {
        let program = SeccompProgram::compile(&blocked).unwrap();
        let insns = program.instructions();
        let kill_index = insns.len() - 1;

        for i in 1..=blocked.len() {
            let target = i + 1 + insns[i].jt as usize;
            prop_assert_eq!(target, kill_index);
        }
    }

    /// Byte serialization round-trips the instruction fields little-endian
    #[test]
    fn prop_bytes_match_instructions(blocked in arb_denylist()) {
        let program = SeccompProgram::compile(&blocked).unwrap();
        let bytes = program.to_bytes();

        for (i, insn) in program.instructions().iter().enumerate() {
            let chunk = &bytes[i * 8..(i + 1) * 8];
            prop_assert_eq!(u16::from_le_bytes([chunk[0], chunk[1]]), insn.opcode);
            prop_assert_eq!(chunk[2], insn.jt);
            prop_assert_eq!(chunk[3], insn.jf);
            prop_assert_eq!(
                u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                insn.k
            );
        }
    }
}
