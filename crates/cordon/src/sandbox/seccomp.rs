//! Seccomp Filter Compilation
//!
//! Compiles a syscall denylist into a raw classic-BPF program suitable for
//! `SECCOMP_SET_MODE_FILTER`. The generated program has a fixed shape:
//!
//! ```text
//! insn 0:      LD  [0]            ; load syscall number
//! insn 1..=N:  JEQ nr, kill, next ; one compare per blocked syscall
//! insn N+1:    RET ALLOW
//! insn N+2:    RET KILL
//! ```
//!
//! The `ALLOW`-then-`KILL` tail ordering and the jump offsets are part of
//! the program's contract: every compare jumps directly to the final
//! `KILL` instruction, everything else falls through to `ALLOW`.

use std::io::Write;

use tempfile::NamedTempFile;

// Classic BPF opcode fields (as in linux/bpf_common.h)
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

/// Seccomp return value: allow the syscall
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
/// Seccomp return value: kill the calling thread
pub const SECCOMP_RET_KILL: u32 = 0x0000_0000;

/// Offset of the syscall number in the kernel's `seccomp_data` struct
const SECCOMP_DATA_NR_OFFSET: u32 = 0;

/// A single 8-byte classic-BPF instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BpfInsn {
    /// Operation code
    pub opcode: u16,
    /// Relative jump offset when the comparison is true
    pub jt: u8,
    /// Relative jump offset when the comparison is false
    pub jf: u8,
    /// Generic operand (syscall number or return value)
    pub k: u32,
}

impl BpfInsn {
    fn new(opcode: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { opcode, jt, jf, k }
    }

    /// Pack into the kernel's on-disk layout (little-endian fields)
    pub fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..2].copy_from_slice(&self.opcode.to_le_bytes());
        bytes[2] = self.jt;
        bytes[3] = self.jf;
        bytes[4..8].copy_from_slice(&self.k.to_le_bytes());
        bytes
    }
}

/// Errors from filter compilation
#[derive(Debug, thiserror::Error)]
pub enum SeccompError {
    /// The denylist is too long for 8-bit jump offsets
    #[error("denylist of {0} syscalls exceeds the 255-entry jump range")]
    TooManySyscalls(usize),
    /// Writing the filter file failed
    #[error("failed to write filter file: {0}")]
    Io(#[from] std::io::Error),
}

/// A compiled seccomp filter program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeccompProgram {
    insns: Vec<BpfInsn>,
}

impl SeccompProgram {
    /// Compile a syscall denylist into a BPF program
    ///
    /// Each blocked syscall at index `i` gets a compare instruction whose
    /// true-jump lands on the trailing `KILL`; the false branch falls
    /// through to the next compare. Output is always
    /// `(3 + blocked.len())` instructions.
    pub fn compile(blocked: &[u32]) -> Result<Self, SeccompError> {
        let n = blocked.len();
        if n > u8::MAX as usize {
            return Err(SeccompError::TooManySyscalls(n));
        }

        let mut insns = Vec::with_capacity(n + 3);
        insns.push(BpfInsn::new(
            BPF_LD | BPF_W | BPF_ABS,
            0,
            0,
            SECCOMP_DATA_NR_OFFSET,
        ));
        for (i, nr) in blocked.iter().enumerate() {
            // remaining compares after this one, plus the ALLOW instruction
            let jt = (n - 1 - i) as u8 + 1;
            insns.push(BpfInsn::new(BPF_JMP | BPF_JEQ | BPF_K, jt, 0, *nr));
        }
        insns.push(BpfInsn::new(BPF_RET | BPF_K, 0, 0, SECCOMP_RET_ALLOW));
        insns.push(BpfInsn::new(BPF_RET | BPF_K, 0, 0, SECCOMP_RET_KILL));

        Ok(Self { insns })
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    /// Whether the program is empty (never true for compiled programs)
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Instruction view
    pub fn instructions(&self) -> &[BpfInsn] {
        &self.insns
    }

    /// Serialize the program to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.insns.len() * 8);
        for insn in &self.insns {
            bytes.extend_from_slice(&insn.to_bytes());
        }
        bytes
    }

    /// Write the program to a uniquely named temporary file
    ///
    /// The returned handle deletes the file on drop, so the filter is
    /// cleaned up on every exit path of the caller.
    pub fn write_filter_file(&self) -> Result<NamedTempFile, SeccompError> {
        let mut file = tempfile::Builder::new()
            .prefix("cordon-seccomp-")
            .suffix(".bpf")
            .tempfile()?;
        file.write_all(&self.to_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// Default syscall denylist (x86_64 numbers)
///
/// Debugger attachment, cross-process memory access, kernel module and
/// kexec loading, mount manipulation, and host power control.
pub fn default_blocked_syscalls() -> Vec<u32> {
    vec![
        101, // ptrace
        310, // process_vm_readv
        311, // process_vm_writev
        165, // mount
        166, // umount2
        155, // pivot_root
        161, // chroot
        167, // swapon
        168, // swapoff
        169, // reboot
        175, // init_module
        176, // delete_module
        313, // finit_module
        246, // kexec_load
        320, // kexec_file_load
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const OP_LOAD: u16 = 0x20;
    const OP_JEQ: u16 = 0x15;
    const OP_RET: u16 = 0x06;

    #[test]
    fn test_opcode_constants() {
        assert_eq!(BPF_LD | BPF_W | BPF_ABS, OP_LOAD);
        assert_eq!(BPF_JMP | BPF_JEQ | BPF_K, OP_JEQ);
        assert_eq!(BPF_RET | BPF_K, OP_RET);
    }

    #[test]
    fn test_program_length() {
        for n in [0usize, 1, 3, 15, 64] {
            let blocked: Vec<u32> = (0..n as u32).collect();
            let program = SeccompProgram::compile(&blocked).unwrap();
            assert_eq!(program.len(), n + 3);
            assert_eq!(program.to_bytes().len(), (3 + n) * 8);
        }
    }

    #[test]
    fn test_program_shape() {
        let blocked = [101u32, 165, 169];
        let program = SeccompProgram::compile(&blocked).unwrap();
        let insns = program.instructions();

        // insn 0 loads the syscall number
        assert_eq!(insns[0].opcode, OP_LOAD);
        assert_eq!(insns[0].k, 0);

        // one compare per blocked syscall
        for (i, nr) in blocked.iter().enumerate() {
            assert_eq!(insns[1 + i].opcode, OP_JEQ);
            assert_eq!(insns[1 + i].k, *nr);
            assert_eq!(insns[1 + i].jf, 0);
        }

        // tail: ALLOW then KILL
        let allow = insns[insns.len() - 2];
        let kill = insns[insns.len() - 1];
        assert_eq!(allow.opcode, OP_RET);
        assert_eq!(allow.k, SECCOMP_RET_ALLOW);
        assert_eq!(kill.opcode, OP_RET);
        assert_eq!(kill.k, SECCOMP_RET_KILL);
    }

    #[test]
    fn test_jump_offsets_target_kill() {
        let blocked = [10u32, 20, 30, 40];
        let program = SeccompProgram::compile(&blocked).unwrap();
        let insns = program.instructions();
        let kill_index = insns.len() - 1;

        for (i, insn) in insns.iter().enumerate().skip(1).take(blocked.len()) {
            // a true comparison must land exactly on the KILL instruction
            let target = i + 1 + insn.jt as usize;
            assert_eq!(target, kill_index, "compare at insn {} jumps to {}", i, target);
        }
    }

    #[test]
    fn test_empty_denylist() {
        let program = SeccompProgram::compile(&[]).unwrap();
        assert_eq!(program.len(), 3);
        let insns = program.instructions();
        assert_eq!(insns[0].opcode, OP_LOAD);
        assert_eq!(insns[1].k, SECCOMP_RET_ALLOW);
        assert_eq!(insns[2].k, SECCOMP_RET_KILL);
    }

    #[test]
    fn test_oversized_denylist_rejected() {
        let blocked: Vec<u32> = (0..300).collect();
        let err = SeccompProgram::compile(&blocked).unwrap_err();
        assert!(matches!(err, SeccompError::TooManySyscalls(300)));
    }

    #[test]
    fn test_insn_byte_layout() {
        let insn = BpfInsn::new(0x15, 2, 0, 0x0102_0304);
        let bytes = insn.to_bytes();
        assert_eq!(bytes, [0x15, 0x00, 0x02, 0x00, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_allow_return_value_bytes() {
        let program = SeccompProgram::compile(&[1]).unwrap();
        let bytes = program.to_bytes();
        // ALLOW is the second-to-last instruction
        let allow = &bytes[bytes.len() - 16..bytes.len() - 8];
        assert_eq!(&allow[4..8], &0x7fff_0000u32.to_le_bytes());
        // KILL is the last instruction
        let kill = &bytes[bytes.len() - 8..];
        assert_eq!(&kill[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_default_denylist_compiles() {
        let blocked = default_blocked_syscalls();
        assert!(!blocked.is_empty());
        let program = SeccompProgram::compile(&blocked).unwrap();
        assert_eq!(program.len(), blocked.len() + 3);
    }

    #[test]
    #[serial_test::serial(seccomp_tempfile)]
    fn test_filter_file_written_and_removed_on_drop() {
        let program = SeccompProgram::compile(&default_blocked_syscalls()).unwrap();
        let path = {
            let file = program.write_filter_file().unwrap();
            let path = file.path().to_path_buf();
            let written = std::fs::read(&path).unwrap();
            assert_eq!(written, program.to_bytes());
            path
        };
        // the handle going out of scope removes the file
        assert!(!path.exists());
    }
}
