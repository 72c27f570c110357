// UPDATE field operations.
//
// Ops apply strictly in the order given, each seeing the field layout
// produced by its predecessors. Scratch bytes produced along the way
// (arithmetic results, splice output) live in the fiber's region and
// are released wholesale at the request boundary.

use std::ptr::NonNull;

use crate::error::{DbError, Result};
use crate::memory::Region;
use crate::proto::{UpdateOp, UpdateOpCode};
use crate::tuple::{TupleBuilder, TupleRef};
use crate::varint;

/// One field of the tuple being rebuilt. Pointers reference either the
/// source tuple's packed data or region scratch; both stay put for the
/// duration of the request.
#[derive(Clone, Copy)]
struct FieldSlot {
    ptr: NonNull<u8>,
    len: usize,
}

impl FieldSlot {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

fn slot_from_region(region: &Region, bytes: &[u8]) -> Result<FieldSlot> {
    Ok(FieldSlot {
        ptr: region.dup(bytes)?,
        len: bytes.len(),
    })
}

/// Apply `ops` to `tuple`, producing the replacement tuple.
pub fn apply_ops(region: &Region, tuple: &TupleRef, ops: &[UpdateOp]) -> Result<TupleRef> {
    let mut fields: Vec<FieldSlot> = Vec::with_capacity(tuple.field_count() as usize + ops.len());
    for field in tuple.fields() {
        fields.push(FieldSlot {
            ptr: NonNull::new(field.as_ptr() as *mut u8).unwrap(),
            len: field.len(),
        });
    }

    for op in ops {
        let at = op.field_no as usize;
        match op.op {
            UpdateOpCode::Assign => {
                let slot = fields.get_mut(at).ok_or(DbError::IllegalParams("update of a missing field"))?;
                *slot = slot_from_region(region, &op.arg)?;
            }
            UpdateOpCode::Add | UpdateOpCode::And | UpdateOpCode::Xor | UpdateOpCode::Or => {
                let slot = fields.get_mut(at).ok_or(DbError::IllegalParams("update of a missing field"))?;
                let result = arith(op.op, slot.as_slice(), &op.arg)?;
                *slot = slot_from_region(region, &result)?;
            }
            UpdateOpCode::Splice => {
                let slot = fields.get_mut(at).ok_or(DbError::IllegalParams("update of a missing field"))?;
                let result = splice(slot.as_slice(), &op.arg)?;
                *slot = slot_from_region(region, &result)?;
            }
            UpdateOpCode::Delete => {
                if at >= fields.len() {
                    return Err(DbError::IllegalParams("delete of a missing field"));
                }
                fields.remove(at);
            }
            UpdateOpCode::Insert => {
                if at > fields.len() {
                    return Err(DbError::IllegalParams("insert past the last field"));
                }
                fields.insert(at, slot_from_region(region, &op.arg)?);
            }
        }
    }

    let mut builder = TupleBuilder::with_capacity(fields.len() as u32);
    for slot in &fields {
        builder.add_field(slot.as_slice());
    }
    Ok(builder.finish())
}

/// Two's-complement arithmetic and bitwise ops on 4- or 8-byte fields.
/// Widths follow the stored field; a 4-byte argument against an 8-byte
/// field is sign-extended for ADD and zero-extended for the bit ops.
fn arith(op: UpdateOpCode, field: &[u8], arg: &[u8]) -> Result<Vec<u8>> {
    match field.len() {
        4 => {
            if arg.len() != 4 {
                return Err(DbError::IllegalParams("argument width must match a 4-byte field"));
            }
            let a = u32::from_le_bytes(field.try_into().unwrap());
            let b = u32::from_le_bytes(arg.try_into().unwrap());
            let r = match op {
                UpdateOpCode::Add => a.wrapping_add(b),
                UpdateOpCode::And => a & b,
                UpdateOpCode::Xor => a ^ b,
                UpdateOpCode::Or => a | b,
                _ => unreachable!(),
            };
            Ok(r.to_le_bytes().to_vec())
        }
        8 => {
            let b = match arg.len() {
                8 => u64::from_le_bytes(arg.try_into().unwrap()),
                4 if op == UpdateOpCode::Add => {
                    i64::from(i32::from_le_bytes(arg.try_into().unwrap())) as u64
                }
                4 => u64::from(u32::from_le_bytes(arg.try_into().unwrap())),
                _ => return Err(DbError::IllegalParams("argument width must be 4 or 8 bytes")),
            };
            let a = u64::from_le_bytes(field.try_into().unwrap());
            let r = match op {
                UpdateOpCode::Add => a.wrapping_add(b),
                UpdateOpCode::And => a & b,
                UpdateOpCode::Xor => a ^ b,
                UpdateOpCode::Or => a | b,
                _ => unreachable!(),
            };
            Ok(r.to_le_bytes().to_vec())
        }
        _ => Err(DbError::IllegalParams("arithmetic on a non-numeric field")),
    }
}

/// Splice argument: three varint-prefixed chunks packed together:
/// offset (i32), cut length (i32), paste bytes. Negative offsets count
/// from the end of the field.
fn splice(field: &[u8], arg: &[u8]) -> Result<Vec<u8>> {
    let (offset_bytes, rest) = take_chunk(arg)?;
    let (length_bytes, rest) = take_chunk(rest)?;
    let (paste, rest) = take_chunk(rest)?;
    if !rest.is_empty() {
        return Err(DbError::IllegalParams("trailing bytes in splice argument"));
    }
    let offset = i32::from_le_bytes(
        offset_bytes
            .try_into()
            .map_err(|_| DbError::IllegalParams("splice offset must be 4 bytes"))?,
    );
    let cut = i32::from_le_bytes(
        length_bytes
            .try_into()
            .map_err(|_| DbError::IllegalParams("splice length must be 4 bytes"))?,
    );

    let len = field.len() as i64;
    let start = if offset < 0 {
        (len + i64::from(offset)).max(0)
    } else {
        i64::from(offset).min(len)
    } as usize;
    if cut < 0 {
        return Err(DbError::IllegalParams("negative splice length"));
    }
    let end = (start + cut as usize).min(field.len());

    let mut out = Vec::with_capacity(field.len() - (end - start) + paste.len());
    out.extend_from_slice(&field[..start]);
    out.extend_from_slice(paste);
    out.extend_from_slice(&field[end..]);
    Ok(out)
}

fn take_chunk(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, used) = varint::read_varint32(data)?;
    let total = used + len as usize;
    if data.len() < total {
        return Err(DbError::BufferTooShort);
    }
    Ok((&data[used..total], &data[total..]))
}
