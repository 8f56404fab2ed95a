//! Instruction libraries
//!
//! Every hardware type publishes a static table mapping instruction names to
//! a typed [`Op`]. An instruction set file selects a subset of these names and
//! assigns them opcodes; execution dispatches on the `Op` with a plain `match`.

use std::fmt;

/// Number of nop modifiers (nop-A, nop-B, nop-C).
pub const NUM_NOPS: usize = 3;

/// Name of the reserved null instruction used for knockouts.
pub const NULL_INST_NAME: &str = "NULL";

/// Hardware family an instruction set targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum HardwareKind {
    /// Classic single-memory heads CPU
    #[default]
    Cpu,
    /// Gene-expression hardware with programids
    Gx,
}

impl HardwareKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cpu" | "classic" | "heads" => Some(HardwareKind::Cpu),
            "gx" | "programid" | "gene-expression" => Some(HardwareKind::Gx),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HardwareKind::Cpu => "cpu",
            HardwareKind::Gx => "gx",
        }
    }

    /// The static library of instructions this hardware understands.
    pub fn library(self) -> &'static [LibEntry] {
        match self {
            HardwareKind::Cpu => CPU_LIBRARY,
            HardwareKind::Gx => GX_LIBRARY,
        }
    }
}

impl fmt::Display for HardwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Semantic operation behind an instruction name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    // Modifiers
    Nop,
    NopX,
    Null,

    // Conditionals
    IfEqu0,
    IfNot0,
    IfNEqu,
    IfEqu,
    IfGr0,
    IfGr,
    IfGrEqu0,
    IfGrEqu,
    IfLess0,
    IfLess,
    IfLsEqu0,
    IfLsEqu,
    IfANotEqB,
    IfBNotEqC,
    IfANotEqC,
    IfBit1,

    // Flow control
    JumpF,
    JumpB,
    Call,
    Return,

    // Stacks
    Pop,
    Push,
    SwitchStack,
    FlipStack,
    PopA,
    PopB,
    PopC,
    PushA,
    PushB,
    PushC,

    // Registers
    Swap,
    SwapAB,
    SwapBC,
    SwapAC,
    CopyReg,
    CopyRegAB,
    CopyRegAC,
    CopyRegBA,
    CopyRegBC,
    CopyRegCA,
    CopyRegCB,

    // Single-argument math
    ShiftR,
    ShiftL,
    Bit1,
    SetNum,
    Inc,
    Dec,
    Zero,
    Neg,
    Square,
    Sqrt,
    Log,
    Log10,
    Not,

    // Double-argument math
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    Nand,
    Nor,
    And,
    Order,
    Xor,

    // Biological
    Copy,
    ReadInst,
    WriteInst,
    StackReadInst,
    StackWriteInst,
    Compare,
    IfNCpy,
    Allocate,
    Divide,
    CAlloc,
    CDivide,
    MaxAlloc,
    Repro,
    Die,
    SetCopyMut,
    ModCopyMut,

    // I/O
    TaskGet,
    TaskPut,
    TaskIO,

    // Heads
    HeadDivide,
    HeadRead,
    HeadWrite,
    HeadCopy,
    HeadSearch,
    HeadPush,
    HeadPop,
    AdvanceHead,
    MoveHead,
    JumpHead,
    GetHead,
    IfLabel,
    IfLabel2,
    SetFlow,
    Skip,

    // Gene expression
    NewProgramid,
    NewGenomeProgramid,
    ProgramidCopy,
    ProgramidDivide,
    Site,
    Bind,
    Bind2,
    IfBind,
    IfBind2,
    NumSites,
    ProgramidImplicitAllocate,
    ProgramidImplicitDivide,
    Promoter,
    Terminator,
    HeadRepress,
    HeadActivate,
    EndProgramid,
    MarkProgramid,
    MarkReadable,
    MarkBindable,
    MarkExecutable,
}

impl Op {
    /// Pseudo-instructions that only delimit programids in a linear genome.
    pub fn is_marker(self) -> bool {
        matches!(self, Op::MarkProgramid | Op::MarkReadable | Op::MarkBindable | Op::MarkExecutable)
    }
}

/// Per-name behaviour flags published by the library.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LibFlags {
    /// Part of the built-in default instruction set
    pub default: bool,
    /// Acts as a label position (site markers)
    pub label: bool,
    pub promoter: bool,
    pub terminator: bool,
}

/// One named instruction in a hardware library.
#[derive(Clone, Copy, Debug)]
pub struct LibEntry {
    pub name: &'static str,
    pub op: Op,
    /// Modifier value when the instruction is a nop
    pub nop_mod: Option<usize>,
    pub flags: LibFlags,
    pub desc: &'static str,
}

const fn entry(name: &'static str, op: Op) -> LibEntry {
    LibEntry { name, op, nop_mod: None, flags: NONE, desc: "" }
}

const fn default_entry(name: &'static str, op: Op, desc: &'static str) -> LibEntry {
    LibEntry { name, op, nop_mod: None, flags: DEFAULT, desc }
}

const fn nop(name: &'static str, modifier: usize) -> LibEntry {
    LibEntry {
        name,
        op: Op::Nop,
        nop_mod: Some(modifier),
        flags: DEFAULT,
        desc: "No-operation instruction; modifies other instructions",
    }
}

const fn flagged(name: &'static str, op: Op, flags: LibFlags, desc: &'static str) -> LibEntry {
    LibEntry { name, op, nop_mod: None, flags, desc }
}

const NONE: LibFlags = LibFlags { default: false, label: false, promoter: false, terminator: false };
const DEFAULT: LibFlags = LibFlags { default: true, label: false, promoter: false, terminator: false };
const LABEL: LibFlags = LibFlags { default: false, label: true, promoter: false, terminator: false };
const PROMOTER: LibFlags = LibFlags { default: false, label: false, promoter: true, terminator: false };
const TERMINATOR: LibFlags = LibFlags { default: false, label: false, promoter: false, terminator: true };

/// Instructions shared by both hardware types.
const COMMON: [LibEntry; 97] = [
    nop("nop-A", 0),
    nop("nop-B", 1),
    nop("nop-C", 2),
    entry("nop-X", Op::NopX),
    entry("if-equ-0", Op::IfEqu0),
    entry("if-not-0", Op::IfNot0),
    default_entry("if-n-equ", Op::IfNEqu, "Execute next instruction if ?BX?!=?CX?, else skip it"),
    entry("if-equ", Op::IfEqu),
    entry("if-grt-0", Op::IfGr0),
    entry("if-grt", Op::IfGr),
    entry("if->=-0", Op::IfGrEqu0),
    entry("if->=", Op::IfGrEqu),
    entry("if-les-0", Op::IfLess0),
    default_entry("if-less", Op::IfLess, "Execute next instruction if ?BX? < ?CX?, else skip it"),
    entry("if-<=-0", Op::IfLsEqu0),
    entry("if-<=", Op::IfLsEqu),
    entry("if-A!=B", Op::IfANotEqB),
    entry("if-B!=C", Op::IfBNotEqC),
    entry("if-A!=C", Op::IfANotEqC),
    entry("if-bit-1", Op::IfBit1),
    entry("call", Op::Call),
    entry("return", Op::Return),
    default_entry("pop", Op::Pop, "Remove top number from stack and place into ?BX?"),
    default_entry("push", Op::Push, "Copy number from ?BX? and place it into the stack"),
    default_entry("swap-stk", Op::SwitchStack, "Toggle which stack is currently being used"),
    entry("flip-stk", Op::FlipStack),
    default_entry("swap", Op::Swap, "Swap the contents of ?BX? with ?CX?"),
    entry("swap-AB", Op::SwapAB),
    entry("swap-BC", Op::SwapBC),
    entry("swap-AC", Op::SwapAC),
    entry("copy-reg", Op::CopyReg),
    entry("set_A=B", Op::CopyRegAB),
    entry("set_A=C", Op::CopyRegAC),
    entry("set_B=A", Op::CopyRegBA),
    entry("set_B=C", Op::CopyRegBC),
    entry("set_C=A", Op::CopyRegCA),
    entry("set_C=B", Op::CopyRegCB),
    entry("pop-A", Op::PopA),
    entry("pop-B", Op::PopB),
    entry("pop-C", Op::PopC),
    entry("push-A", Op::PushA),
    entry("push-B", Op::PushB),
    entry("push-C", Op::PushC),
    default_entry("shift-r", Op::ShiftR, "Shift bits in ?BX? right by one (divide by two)"),
    default_entry("shift-l", Op::ShiftL, "Shift bits in ?BX? left by one (multiply by two)"),
    entry("bit-1", Op::Bit1),
    entry("set-num", Op::SetNum),
    default_entry("inc", Op::Inc, "Increment ?BX? by one"),
    default_entry("dec", Op::Dec, "Decrement ?BX? by one"),
    entry("zero", Op::Zero),
    entry("neg", Op::Neg),
    entry("square", Op::Square),
    entry("sqrt", Op::Sqrt),
    entry("log", Op::Log),
    entry("log10", Op::Log10),
    entry("not", Op::Not),
    default_entry("add", Op::Add, "Add BX to CX and place the result in ?BX?"),
    default_entry("sub", Op::Sub, "Subtract CX from BX and place the result in ?BX?"),
    entry("mult", Op::Mult),
    entry("div", Op::Div),
    entry("mod", Op::Mod),
    default_entry("nand", Op::Nand, "Nand BX by CX and place the result in ?BX?"),
    entry("nor", Op::Nor),
    entry("and", Op::And),
    entry("order", Op::Order),
    entry("xor", Op::Xor),
    entry("copy", Op::Copy),
    entry("read", Op::ReadInst),
    entry("write", Op::WriteInst),
    entry("stk-read", Op::StackReadInst),
    entry("stk-writ", Op::StackWriteInst),
    entry("compare", Op::Compare),
    entry("if-n-cpy", Op::IfNCpy),
    entry("allocate", Op::Allocate),
    entry("c-alloc", Op::CAlloc),
    entry("get", Op::TaskGet),
    entry("put", Op::TaskPut),
    default_entry("IO", Op::TaskIO, "Output ?BX?, and input new number back into ?BX?"),
    entry("set-cmut", Op::SetCopyMut),
    entry("mod-cmut", Op::ModCopyMut),
    default_entry("h-alloc", Op::MaxAlloc, "Allocate maximum allowed space"),
    default_entry("h-divide", Op::HeadDivide, "Divide code between read and write heads."),
    entry("h-read", Op::HeadRead),
    entry("h-write", Op::HeadWrite),
    default_entry("h-copy", Op::HeadCopy, "Copy from read-head to write-head; advance both"),
    default_entry("h-search", Op::HeadSearch, "Find complement template and make with flow head"),
    entry("h-push", Op::HeadPush),
    entry("h-pop", Op::HeadPop),
    entry("adv-head", Op::AdvanceHead),
    default_entry("mov-head", Op::MoveHead, "Move head ?IP? to the flow head"),
    default_entry("jmp-head", Op::JumpHead, "Move head ?IP? by amount in CX register; CX = old pos."),
    default_entry("get-head", Op::GetHead, "Copy the position of the ?IP? head into CX"),
    default_entry("if-label", Op::IfLabel, "Execute next if we copied complement of attached label"),
    entry("if-label2", Op::IfLabel2),
    default_entry("set-flow", Op::SetFlow, "Set flow-head to position in ?CX?"),
    entry("repro", Op::Repro),
    entry("die", Op::Die),
];

const CPU_ONLY: [LibEntry; 5] = [
    entry("jump-f", Op::JumpF),
    entry("jump-b", Op::JumpB),
    entry("divide", Op::Divide),
    entry("c-divide", Op::CDivide),
    entry("skip", Op::Skip),
];

const GX_ONLY: [LibEntry; 21] = [
    entry("p-alloc", Op::NewProgramid),
    entry("g-alloc", Op::NewGenomeProgramid),
    entry("p-copy", Op::ProgramidCopy),
    entry("p-divide", Op::ProgramidDivide),
    flagged("site", Op::Site, LABEL, "Binding site marker"),
    entry("bind", Op::Bind),
    entry("bind2", Op::Bind2),
    entry("if-bind", Op::IfBind),
    entry("if-bind2", Op::IfBind2),
    entry("num-sites", Op::NumSites),
    entry("i-alloc", Op::ProgramidImplicitAllocate),
    entry("i-divide", Op::ProgramidImplicitDivide),
    flagged("promoter", Op::Promoter, PROMOTER, "Transcription start site"),
    flagged("terminator", Op::Terminator, TERMINATOR, "Transcription stop site"),
    entry("h-repress", Op::HeadRepress),
    entry("h-activate", Op::HeadActivate),
    entry("end", Op::EndProgramid),
    entry("PROGRAMID", Op::MarkProgramid),
    entry("READABLE", Op::MarkReadable),
    entry("BINDABLE", Op::MarkBindable),
    entry("EXECUTABLE", Op::MarkExecutable),
];

const fn concat<const A: usize, const B: usize, const C: usize>(a: [LibEntry; A], b: [LibEntry; B]) -> [LibEntry; C] {
    let mut out = [entry("", Op::NopX); C];
    let mut i = 0;
    while i < A {
        out[i] = a[i];
        i += 1;
    }
    let mut j = 0;
    while j < B {
        out[A + j] = b[j];
        j += 1;
    }
    out
}

static CPU_TABLE: [LibEntry; 102] = concat::<97, 5, 102>(COMMON, CPU_ONLY);
static GX_TABLE: [LibEntry; 118] = concat::<97, 21, 118>(COMMON, GX_ONLY);

/// Classic heads CPU library.
pub static CPU_LIBRARY: &[LibEntry] = &CPU_TABLE;
/// Gene-expression library.
pub static GX_LIBRARY: &[LibEntry] = &GX_TABLE;

/// The built-in default instruction set for the classic CPU, in opcode order.
pub const DEFAULT_CPU_SET: [&str; 26] = [
    "nop-A", "nop-B", "nop-C", "if-n-equ", "if-less", "if-label", "mov-head", "jmp-head",
    "get-head", "set-flow", "shift-r", "shift-l", "inc", "dec", "push", "pop", "swap-stk",
    "swap", "add", "sub", "nand", "h-copy", "h-alloc", "h-divide", "IO", "h-search",
];

/// The built-in gene-expression set: the heads set plus programid machinery.
/// The trailing markers delimit programids inside a linear genome.
pub const DEFAULT_GX_SET: [&str; 40] = [
    "nop-A", "nop-B", "nop-C", "if-n-equ", "if-less", "if-label", "mov-head", "jmp-head",
    "get-head", "set-flow", "shift-r", "shift-l", "inc", "dec", "push", "pop", "swap-stk",
    "swap", "add", "sub", "nand", "h-copy", "h-alloc", "h-divide", "IO", "h-search",
    "p-alloc", "p-copy", "p-divide", "site", "bind", "if-bind", "promoter", "terminator",
    "end", "num-sites", "PROGRAMID", "READABLE", "BINDABLE", "EXECUTABLE",
];

/// Look up a library entry by exact name.
pub fn find_entry(kind: HardwareKind, name: &str) -> Option<&'static LibEntry> {
    kind.library().iter().find(|e| e.name == name)
}

/// The library name closest to `name` by edit distance, for error messages.
pub fn nearest_name(kind: HardwareKind, name: &str) -> Option<&'static str> {
    kind.library()
        .iter()
        .map(|e| (crate::sequence::str_edit_distance(e.name, name), e.name))
        .min_by_key(|&(dist, _)| dist)
        .map(|(_, n)| n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_library_names_unique() {
        for kind in [HardwareKind::Cpu, HardwareKind::Gx] {
            let mut seen = HashSet::new();
            for e in kind.library() {
                assert!(!e.name.is_empty());
                assert!(seen.insert(e.name), "duplicate {} in {}", e.name, kind);
            }
        }
    }

    #[test]
    fn test_nops_lead_library() {
        for kind in [HardwareKind::Cpu, HardwareKind::Gx] {
            let lib = kind.library();
            for (i, e) in lib.iter().take(NUM_NOPS).enumerate() {
                assert_eq!(e.nop_mod, Some(i));
            }
            assert!(lib.iter().skip(NUM_NOPS).all(|e| e.nop_mod.is_none()));
        }
    }

    #[test]
    fn test_default_sets_resolve() {
        for name in DEFAULT_CPU_SET {
            assert!(find_entry(HardwareKind::Cpu, name).is_some(), "{}", name);
        }
        for name in DEFAULT_GX_SET {
            assert!(find_entry(HardwareKind::Gx, name).is_some(), "{}", name);
        }
        assert!(find_entry(HardwareKind::Cpu, "p-copy").is_none());
    }

    #[test]
    fn test_nearest_name() {
        assert_eq!(nearest_name(HardwareKind::Cpu, "h-cpy"), Some("h-copy"));
        assert_eq!(nearest_name(HardwareKind::Gx, "bind3"), Some("bind"));
    }

    #[test]
    fn test_marker_flags() {
        assert!(find_entry(HardwareKind::Gx, "promoter").map_or(false, |e| e.flags.promoter));
        assert!(find_entry(HardwareKind::Gx, "terminator").map_or(false, |e| e.flags.terminator));
        assert!(find_entry(HardwareKind::Gx, "site").map_or(false, |e| e.flags.label));
    }

    #[test]
    fn test_hardware_kind_parse() {
        assert_eq!(HardwareKind::parse("GX"), Some(HardwareKind::Gx));
        assert_eq!(HardwareKind::parse("cpu"), Some(HardwareKind::Cpu));
        assert_eq!(HardwareKind::parse("smt"), None);
    }
}
