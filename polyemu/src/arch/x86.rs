register_set!(
    /// i386 register file.
    RegisterX86 {
        EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI, EIP, EFLAGS,
        CS, SS, DS, ES, FS, GS, FS_BASE, GS_BASE,
    }
);

register_set!(
    /// amd64 register file.
    RegisterX8664 {
        RAX, RBX, RCX, RDX, RSI, RDI, RBP, RSP,
        R8, R9, R10, R11, R12, R13, R14, R15,
        RIP, RFLAGS, CS, SS, DS, ES, FS, GS, FS_BASE, GS_BASE,
    }
);

/// Carry flag bit in EFLAGS/RFLAGS.
pub const FLAG_CF: u64 = 1;
