//! Decoding of the JVM instruction encoding into [`Instruction`]s.

use crate::descriptor::{DescriptorFactory, FieldDescriptor};
use crate::error::{AnalysisError, Result, malformed_cfg};
use crate::ir::{
    ArithmeticOp, CallKind, CallSite, Condition, ConstantOperand, Instruction, InstructionKind,
    StackOp, ValueKind,
};
use crate::opcodes;

/// Member reference resolved from the constant pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// Resolves constant pool indices referenced by instructions.
pub trait ConstantPoolResolver {
    fn class_name(&self, index: u16) -> Result<String>;
    fn field_ref(&self, index: u16) -> Result<MemberRef>;
    /// Resolves `Methodref` and `InterfaceMethodref` entries.
    fn method_ref(&self, index: u16) -> Result<MemberRef>;
    /// Resolves the name and descriptor of an `InvokeDynamic` entry.
    fn invoke_dynamic(&self, index: u16) -> Result<(String, String)>;
    /// Resolves a loadable constant (`ldc`, `ldc_w`, `ldc2_w`).
    fn constant(&self, index: u16) -> Result<ConstantOperand>;
}

/// Decodes a method's code array. Field references are interned through
/// `descriptors`; `label` names the method in errors.
pub fn decode(
    code: &[u8],
    pool: &dyn ConstantPoolResolver,
    descriptors: &DescriptorFactory,
    label: &str,
) -> Result<Vec<Instruction>> {
    let decoder = Decoder {
        code,
        pool,
        descriptors,
        label,
    };
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let (kind, length) = decoder.decode_at(offset)?;
        instructions.push(Instruction {
            offset: offset as u32,
            length: length as u32,
            opcode: code[offset],
            kind,
        });
        offset += length;
    }
    Ok(instructions)
}

struct Decoder<'a> {
    code: &'a [u8],
    pool: &'a dyn ConstantPoolResolver,
    descriptors: &'a DescriptorFactory,
    label: &'a str,
}

impl Decoder<'_> {
    fn decode_at(&self, offset: usize) -> Result<(InstructionKind, usize)> {
        use InstructionKind as K;

        let opcode = self.code[offset];
        let decoded = match opcode {
            opcodes::NOP => (K::Nop, 1),
            opcodes::ACONST_NULL => (K::Constant(ConstantOperand::Null), 1),
            opcodes::ICONST_M1..=opcodes::ICONST_5 => (
                K::Constant(ConstantOperand::Int(
                    i32::from(opcode) - i32::from(opcodes::ICONST_0),
                )),
                1,
            ),
            opcodes::LCONST_0 | opcodes::LCONST_1 => (
                K::Constant(ConstantOperand::Long(i64::from(opcode - opcodes::LCONST_0))),
                1,
            ),
            opcodes::FCONST_0..=opcodes::FCONST_2 => (
                K::Constant(ConstantOperand::Float(f32::from(opcode - opcodes::FCONST_0))),
                1,
            ),
            opcodes::DCONST_0 | opcodes::DCONST_1 => (
                K::Constant(ConstantOperand::Double(f64::from(opcode - opcodes::DCONST_0))),
                1,
            ),
            opcodes::BIPUSH => (
                K::Constant(ConstantOperand::Int(i32::from(self.read_i8(offset + 1)?))),
                2,
            ),
            opcodes::SIPUSH => (
                K::Constant(ConstantOperand::Int(i32::from(self.read_i16(offset + 1)?))),
                3,
            ),
            opcodes::LDC => (
                K::Constant(self.pool.constant(u16::from(self.read_u8(offset + 1)?))?),
                2,
            ),
            opcodes::LDC_W | opcodes::LDC2_W => {
                (K::Constant(self.pool.constant(self.read_u16(offset + 1)?)?), 3)
            }
            opcodes::ILOAD..=opcodes::ALOAD => (
                K::Load {
                    slot: u16::from(self.read_u8(offset + 1)?),
                    kind: typed_kind(opcode - opcodes::ILOAD),
                },
                2,
            ),
            opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
                let index = opcode - opcodes::ILOAD_0;
                (
                    K::Load {
                        slot: u16::from(index % 4),
                        kind: typed_kind(index / 4),
                    },
                    1,
                )
            }
            opcodes::IALOAD..=opcodes::SALOAD => (K::ArrayLoad(array_kind(opcode - opcodes::IALOAD)), 1),
            opcodes::ISTORE..=opcodes::ASTORE => (
                K::Store {
                    slot: u16::from(self.read_u8(offset + 1)?),
                    kind: typed_kind(opcode - opcodes::ISTORE),
                },
                2,
            ),
            opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
                let index = opcode - opcodes::ISTORE_0;
                (
                    K::Store {
                        slot: u16::from(index % 4),
                        kind: typed_kind(index / 4),
                    },
                    1,
                )
            }
            opcodes::IASTORE..=opcodes::SASTORE => {
                (K::ArrayStore(array_kind(opcode - opcodes::IASTORE)), 1)
            }
            opcodes::POP => (K::Stack(StackOp::Pop), 1),
            opcodes::POP2 => (K::Stack(StackOp::Pop2), 1),
            opcodes::DUP => (K::Stack(StackOp::Dup), 1),
            opcodes::DUP_X1 => (K::Stack(StackOp::DupX1), 1),
            opcodes::DUP_X2 => (K::Stack(StackOp::DupX2), 1),
            opcodes::DUP2 => (K::Stack(StackOp::Dup2), 1),
            opcodes::DUP2_X1 => (K::Stack(StackOp::Dup2X1), 1),
            opcodes::DUP2_X2 => (K::Stack(StackOp::Dup2X2), 1),
            opcodes::SWAP => (K::Stack(StackOp::Swap), 1),
            opcodes::IADD..=opcodes::DREM => {
                let index = opcode - opcodes::IADD;
                let op = match index / 4 {
                    0 => ArithmeticOp::Add,
                    1 => ArithmeticOp::Sub,
                    2 => ArithmeticOp::Mul,
                    3 => ArithmeticOp::Div,
                    _ => ArithmeticOp::Rem,
                };
                (
                    K::Arithmetic {
                        op,
                        kind: typed_kind(index % 4),
                    },
                    1,
                )
            }
            opcodes::INEG..=opcodes::DNEG => (K::Negate(typed_kind(opcode - opcodes::INEG)), 1),
            opcodes::ISHL..=opcodes::LXOR => {
                let index = opcode - opcodes::ISHL;
                let op = match index / 2 {
                    0 => ArithmeticOp::Shl,
                    1 => ArithmeticOp::Shr,
                    2 => ArithmeticOp::Ushr,
                    3 => ArithmeticOp::And,
                    4 => ArithmeticOp::Or,
                    _ => ArithmeticOp::Xor,
                };
                let kind = if index % 2 == 0 {
                    ValueKind::Int
                } else {
                    ValueKind::Long
                };
                (K::Arithmetic { op, kind }, 1)
            }
            opcodes::IINC => (
                K::Increment {
                    slot: u16::from(self.read_u8(offset + 1)?),
                    delta: i32::from(self.read_i8(offset + 2)?),
                },
                3,
            ),
            opcodes::I2L..=opcodes::I2S => {
                let (from, to) = conversion(opcode);
                (K::Convert { from, to }, 1)
            }
            opcodes::LCMP => (K::Compare(ValueKind::Long), 1),
            opcodes::FCMPL | opcodes::FCMPG => (K::Compare(ValueKind::Float), 1),
            opcodes::DCMPL | opcodes::DCMPG => (K::Compare(ValueKind::Double), 1),
            opcodes::IFEQ..=opcodes::IF_ACMPNE | opcodes::IFNULL | opcodes::IFNONNULL => {
                let (condition, operands) = branch_condition(opcode);
                let target = self.relative_target(offset, i32::from(self.read_i16(offset + 1)?))?;
                (
                    K::Branch {
                        condition,
                        operands,
                        target,
                    },
                    3,
                )
            }
            opcodes::GOTO => {
                let target = self.relative_target(offset, i32::from(self.read_i16(offset + 1)?))?;
                (K::Goto { target }, 3)
            }
            opcodes::GOTO_W => {
                let target = self.relative_target(offset, self.read_i32(offset + 1)?)?;
                (K::Goto { target }, 5)
            }
            opcodes::JSR => {
                let target = self.relative_target(offset, i32::from(self.read_i16(offset + 1)?))?;
                (K::Jsr { target }, 3)
            }
            opcodes::JSR_W => {
                let target = self.relative_target(offset, self.read_i32(offset + 1)?)?;
                (K::Jsr { target }, 5)
            }
            opcodes::RET => (
                K::Ret {
                    slot: u16::from(self.read_u8(offset + 1)?),
                },
                2,
            ),
            opcodes::TABLESWITCH => self.tableswitch(offset)?,
            opcodes::LOOKUPSWITCH => self.lookupswitch(offset)?,
            opcodes::IRETURN..=opcodes::ARETURN => {
                (K::Return(Some(typed_kind(opcode - opcodes::IRETURN))), 1)
            }
            opcodes::RETURN => (K::Return(None), 1),
            opcodes::GETSTATIC | opcodes::GETFIELD => {
                let field = self.field(offset, opcode == opcodes::GETSTATIC)?;
                (K::GetField(field), 3)
            }
            opcodes::PUTSTATIC | opcodes::PUTFIELD => {
                let field = self.field(offset, opcode == opcodes::PUTSTATIC)?;
                (K::PutField(field), 3)
            }
            opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => {
                let kind = match opcode {
                    opcodes::INVOKEVIRTUAL => CallKind::Virtual,
                    opcodes::INVOKESPECIAL => CallKind::Special,
                    _ => CallKind::Static,
                };
                (K::Invoke(self.call_site(offset, kind)?), 3)
            }
            opcodes::INVOKEINTERFACE => (K::Invoke(self.call_site(offset, CallKind::Interface)?), 5),
            opcodes::INVOKEDYNAMIC => {
                let (name, signature) = self.pool.invoke_dynamic(self.read_u16(offset + 1)?)?;
                (K::InvokeDynamic { name, signature }, 5)
            }
            opcodes::NEW => (K::New(self.pool.class_name(self.read_u16(offset + 1)?)?), 3),
            opcodes::NEWARRAY => {
                self.read_u8(offset + 1)?;
                (K::NewArray { dimensions: 1 }, 2)
            }
            opcodes::ANEWARRAY => {
                self.pool.class_name(self.read_u16(offset + 1)?)?;
                (K::NewArray { dimensions: 1 }, 3)
            }
            opcodes::MULTIANEWARRAY => {
                self.pool.class_name(self.read_u16(offset + 1)?)?;
                let dimensions = self.read_u8(offset + 3)?;
                if dimensions == 0 {
                    return Err(self.malformed(offset, "multianewarray with zero dimensions"));
                }
                (K::NewArray { dimensions }, 4)
            }
            opcodes::ARRAYLENGTH => (K::ArrayLength, 1),
            opcodes::ATHROW => (K::Throw, 1),
            opcodes::CHECKCAST => (K::CheckCast(self.pool.class_name(self.read_u16(offset + 1)?)?), 3),
            opcodes::INSTANCEOF => (K::InstanceOf(self.pool.class_name(self.read_u16(offset + 1)?)?), 3),
            opcodes::MONITORENTER => (K::MonitorEnter, 1),
            opcodes::MONITOREXIT => (K::MonitorExit, 1),
            opcodes::WIDE => self.wide(offset)?,
            other => {
                return Err(self.malformed(offset, &format!("invalid opcode 0x{other:02x}")));
            }
        };
        Ok(decoded)
    }

    fn wide(&self, offset: usize) -> Result<(InstructionKind, usize)> {
        let opcode = self.read_u8(offset + 1)?;
        let slot = self.read_u16(offset + 2)?;
        let decoded = match opcode {
            opcodes::ILOAD..=opcodes::ALOAD => (
                InstructionKind::Load {
                    slot,
                    kind: typed_kind(opcode - opcodes::ILOAD),
                },
                4,
            ),
            opcodes::ISTORE..=opcodes::ASTORE => (
                InstructionKind::Store {
                    slot,
                    kind: typed_kind(opcode - opcodes::ISTORE),
                },
                4,
            ),
            opcodes::RET => (InstructionKind::Ret { slot }, 4),
            opcodes::IINC => (
                InstructionKind::Increment {
                    slot,
                    delta: i32::from(self.read_i16(offset + 4)?),
                },
                6,
            ),
            other => {
                return Err(self.malformed(offset, &format!("wide cannot modify opcode 0x{other:02x}")));
            }
        };
        Ok(decoded)
    }

    fn tableswitch(&self, offset: usize) -> Result<(InstructionKind, usize)> {
        let base = offset + 1 + padding(offset);
        let default = self.relative_target(offset, self.read_i32(base)?)?;
        let low = self.read_i32(base + 4)?;
        let high = self.read_i32(base + 8)?;
        if high < low {
            return Err(self.malformed(offset, "tableswitch high is below low"));
        }
        let count = (i64::from(high) - i64::from(low) + 1) as usize;
        let end = base + 12 + count * 4;
        if end > self.code.len() {
            return Err(self.malformed(offset, "truncated tableswitch"));
        }
        let mut targets = Vec::with_capacity(count);
        for index in 0..count {
            targets.push(self.relative_target(offset, self.read_i32(base + 12 + index * 4)?)?);
        }
        Ok((InstructionKind::Switch { default, targets }, end - offset))
    }

    fn lookupswitch(&self, offset: usize) -> Result<(InstructionKind, usize)> {
        let base = offset + 1 + padding(offset);
        let default = self.relative_target(offset, self.read_i32(base)?)?;
        let npairs = self.read_i32(base + 4)?;
        if npairs < 0 {
            return Err(self.malformed(offset, "lookupswitch with negative pair count"));
        }
        let count = npairs as usize;
        let end = base + 8 + count * 8;
        if end > self.code.len() {
            return Err(self.malformed(offset, "truncated lookupswitch"));
        }
        let mut targets = Vec::with_capacity(count);
        for index in 0..count {
            let pair = base + 8 + index * 8;
            targets.push(self.relative_target(offset, self.read_i32(pair + 4)?)?);
        }
        Ok((InstructionKind::Switch { default, targets }, end - offset))
    }

    fn field(&self, offset: usize, is_static: bool) -> Result<FieldDescriptor> {
        let member = self.pool.field_ref(self.read_u16(offset + 1)?)?;
        Ok(self
            .descriptors
            .field_descriptor(&member.owner, &member.name, &member.descriptor, is_static))
    }

    fn call_site(&self, offset: usize, kind: CallKind) -> Result<CallSite> {
        let member = self.pool.method_ref(self.read_u16(offset + 1)?)?;
        Ok(CallSite {
            owner: member.owner,
            name: member.name,
            descriptor: member.descriptor,
            kind,
            offset: offset as u32,
        })
    }

    fn relative_target(&self, offset: usize, relative: i32) -> Result<u32> {
        let target = offset as i64 + i64::from(relative);
        u32::try_from(target).map_err(|_| {
            malformed_cfg!(
                self.label,
                "branch at offset {} targets negative offset {}",
                offset,
                target
            )
        })
    }

    fn read_u8(&self, offset: usize) -> Result<u8> {
        self.code
            .get(offset)
            .copied()
            .ok_or_else(|| self.malformed(offset, "truncated instruction"))
    }

    fn read_i8(&self, offset: usize) -> Result<i8> {
        Ok(self.read_u8(offset)? as i8)
    }

    fn read_u16(&self, offset: usize) -> Result<u16> {
        let bytes = self
            .code
            .get(offset..offset + 2)
            .ok_or_else(|| self.malformed(offset, "truncated instruction"))?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i16(&self, offset: usize) -> Result<i16> {
        Ok(self.read_u16(offset)? as i16)
    }

    fn read_i32(&self, offset: usize) -> Result<i32> {
        let bytes = self
            .code
            .get(offset..offset + 4)
            .ok_or_else(|| self.malformed(offset, "truncated instruction"))?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn malformed(&self, offset: usize, message: &str) -> AnalysisError {
        AnalysisError::MalformedClass {
            class: self.label.to_string(),
            message: format!("{message} at offset {offset}"),
        }
    }
}

/// Alignment padding after a switch opcode.
fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

/// Maps the i/l/f/d/a ordering shared by typed opcode families.
fn typed_kind(index: u8) -> ValueKind {
    match index {
        0 => ValueKind::Int,
        1 => ValueKind::Long,
        2 => ValueKind::Float,
        3 => ValueKind::Double,
        _ => ValueKind::Reference,
    }
}

/// Element kinds of `xaload`/`xastore`: i l f d a b c s.
fn array_kind(index: u8) -> ValueKind {
    match index {
        0 | 5..=7 => ValueKind::Int,
        other => typed_kind(other),
    }
}

fn conversion(opcode: u8) -> (ValueKind, ValueKind) {
    use ValueKind::{Double, Float, Int, Long};
    match opcode {
        opcodes::I2L => (Int, Long),
        opcodes::I2F => (Int, Float),
        opcodes::I2D => (Int, Double),
        opcodes::L2I => (Long, Int),
        opcodes::L2F => (Long, Float),
        opcodes::L2D => (Long, Double),
        opcodes::F2I => (Float, Int),
        opcodes::F2L => (Float, Long),
        opcodes::F2D => (Float, Double),
        opcodes::D2I => (Double, Int),
        opcodes::D2L => (Double, Long),
        opcodes::D2F => (Double, Float),
        _ => (Int, Int),
    }
}

fn branch_condition(opcode: u8) -> (Condition, u8) {
    match opcode {
        opcodes::IFEQ => (Condition::Eq, 1),
        opcodes::IFNE => (Condition::Ne, 1),
        opcodes::IFLT => (Condition::Lt, 1),
        opcodes::IFGE => (Condition::Ge, 1),
        opcodes::IFGT => (Condition::Gt, 1),
        opcodes::IFLE => (Condition::Le, 1),
        opcodes::IF_ICMPEQ | opcodes::IF_ACMPEQ => (Condition::Eq, 2),
        opcodes::IF_ICMPNE | opcodes::IF_ACMPNE => (Condition::Ne, 2),
        opcodes::IF_ICMPLT => (Condition::Lt, 2),
        opcodes::IF_ICMPGE => (Condition::Ge, 2),
        opcodes::IF_ICMPGT => (Condition::Gt, 2),
        opcodes::IF_ICMPLE => (Condition::Le, 2),
        opcodes::IFNULL => (Condition::Null, 1),
        _ => (Condition::NonNull, 1),
    }
}
