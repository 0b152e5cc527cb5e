register_set!(
    RegisterArm {
        R0, R1, R2, R3, R4, R5, R6, R7, R8, R9, R10, R11, R12,
        // C13_C0_3 is TPIDRURO, the tls register.
        SP, LR, PC, CPSR, C13_C0_3,
    }
);

register_set!(
    RegisterArm64 {
        X0, X1, X2, X3, X4, X5, X6, X7, X8, X9, X10, X11, X12, X13, X14, X15,
        X16, X17, X18, X19, X20, X21, X22, X23, X24, X25, X26, X27, X28,
        FP, LR, SP, PC, NZCV, TPIDR_EL0,
    }
);
