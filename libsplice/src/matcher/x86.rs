use iced_x86::{
    ConstantOffsets, Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind,
    Register,
};

use super::decoder::*;

/// x86 instructions are at most 15 bytes
const MAX_INSN_LEN: usize = 15;

/// `iced_x86` backed decoder
#[derive(Debug, Clone, Copy)]
pub struct X86Decoder {
    bitness: u32,
}

impl X86Decoder {
    pub fn new(bitness: u32) -> Self {
        Self { bitness }
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    fn immediate(offsets: &ConstantOffsets, second: bool) -> Option<Field> {
        let (present, offset, size) = if second {
            (
                offsets.has_immediate2(),
                offsets.immediate_offset2(),
                offsets.immediate_size2(),
            )
        } else {
            (
                offsets.has_immediate(),
                offsets.immediate_offset(),
                offsets.immediate_size(),
            )
        };
        present.then_some(Field {
            offset: offset as u8,
            size: size as u8,
        })
    }

    fn operand(insn: &Instruction, offsets: &ConstantOffsets, i: u32) -> Operand {
        match insn.op_kind(i) {
            OpKind::Register => Operand {
                base: insn.op_register(i) as u32,
                ..Operand::new(OperandKind::Register)
            },
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Operand {
                target: insn.near_branch_target(),
                field: Self::immediate(offsets, false),
                ..Operand::new(OperandKind::NearBranch)
            },
            OpKind::FarBranch16 | OpKind::FarBranch32 => Operand {
                segment: u32::from(insn.far_branch_selector()),
                target: u64::from(insn.far_branch32()),
                field: Self::immediate(offsets, false),
                ..Operand::new(OperandKind::FarBranch)
            },
            OpKind::Immediate8_2nd => Operand {
                field: Self::immediate(offsets, true),
                ..Operand::new(OperandKind::Immediate)
            },
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Operand {
                field: Self::immediate(offsets, false),
                ..Operand::new(OperandKind::Immediate)
            },
            OpKind::Memory => Operand {
                base: insn.memory_base() as u32,
                index: insn.memory_index() as u32,
                scale: insn.memory_index_scale(),
                segment: insn.memory_segment() as u32,
                field: offsets.has_displacement().then_some(Field {
                    offset: offsets.displacement_offset() as u8,
                    size: offsets.displacement_size() as u8,
                }),
                ..Operand::new(OperandKind::Memory)
            },
            // String instruction operands: implicit registers only
            _ => Operand {
                base: insn.memory_base() as u32,
                segment: insn.memory_segment() as u32,
                ..Operand::new(OperandKind::Memory)
            },
        }
    }

    /// Writes to a 32-bit register clear the upper half in 64-bit mode
    fn same_full_register(&self, a: Register, b: Register) -> bool {
        a == b && !(self.bitness == 64 && a.is_gpr32())
    }

    fn is_nop(&self, insn: &Instruction) -> bool {
        match insn.mnemonic() {
            Mnemonic::Nop => true,
            Mnemonic::Mov | Mnemonic::Xchg => {
                insn.op_count() == 2
                    && insn.op0_kind() == OpKind::Register
                    && insn.op1_kind() == OpKind::Register
                    && self.same_full_register(insn.op0_register(), insn.op1_register())
            }
            Mnemonic::Lea => {
                insn.op_count() == 2
                    && insn.op0_kind() == OpKind::Register
                    && insn.op1_kind() == OpKind::Memory
                    && insn.memory_index() == Register::None
                    && insn.memory_displacement64() == 0
                    && self.same_full_register(insn.op0_register(), insn.memory_base())
            }
            _ => false,
        }
    }

    fn is_unconditional(insn: &Instruction) -> bool {
        matches!(
            insn.flow_control(),
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch | FlowControl::Return
        ) || matches!(insn.mnemonic(), Mnemonic::Syscall | Mnemonic::Sysenter)
    }
}

impl InsnDecoder for X86Decoder {
    fn max_len(&self) -> usize {
        MAX_INSN_LEN
    }

    fn decode(&self, bytes: &[u8], ip: u64) -> Option<Insn> {
        if bytes.is_empty() {
            return None;
        }

        let mut decoder = Decoder::try_with_ip(self.bitness, bytes, ip, DecoderOptions::NONE).ok()?;
        let insn = decoder.decode();

        if insn.is_invalid() {
            return Some(Insn {
                mnemonic: Mnemonic::INVALID as u32,
                len: insn.len().max(1),
                operands: Vec::new(),
                nop: false,
                unconditional: false,
                call: false,
                trap: false,
                invalid: true,
            });
        }

        let offsets = decoder.get_constant_offsets(&insn);
        let operands = (0..insn.op_count())
            .map(|i| Self::operand(&insn, &offsets, i))
            .collect();

        Some(Insn {
            mnemonic: insn.mnemonic() as u32,
            len: insn.len(),
            operands,
            nop: self.is_nop(&insn),
            unconditional: Self::is_unconditional(&insn),
            call: insn.mnemonic() == Mnemonic::Call,
            trap: insn.mnemonic() == Mnemonic::Ud2,
            invalid: false,
        })
    }
}
