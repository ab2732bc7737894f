//! Variable references. The debug protocol needs a single integer handle
//! space shared between "expand this scope" and "expand this lazy
//! variable", so the two lookup kinds are packed into one 31-bit integer
//! at the protocol boundary and kept as a tagged variant everywhere else.
//!
//! Bit 30 set: bits 29-16 carry the frame id (truncated to 14 bits) and
//! bits 15-0 the server-assigned variable id. Bit 30 clear: the value is a
//! frame id. Zero means "fully resolved scalar, nothing to expand" - frame
//! ids therefore start at one.

use crate::remote::proto::RawVariable;
use serde_json::Value;

const EXPAND_BIT: i64 = 1 << 30;
const FRAME_MASK: i64 = 0x3FFF;
const VAR_MASK: i64 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarRef {
    Scope { frame_id: u32 },
    Variable { frame_id: u32, var_id: u32 },
}

impl VarRef {
    pub fn pack(self) -> i64 {
        match self {
            VarRef::Scope { frame_id } => i64::from(frame_id),
            VarRef::Variable { frame_id, var_id } => {
                EXPAND_BIT
                    | ((i64::from(frame_id) & FRAME_MASK) << 16)
                    | (i64::from(var_id) & VAR_MASK)
            }
        }
    }

    /// Decode a packed reference. Zero is "nothing to expand" and decodes
    /// to `None`, never to a variable lookup.
    pub fn unpack(raw: i64) -> Option<VarRef> {
        if raw == 0 {
            return None;
        }
        if raw & EXPAND_BIT != 0 {
            Some(VarRef::Variable {
                frame_id: ((raw >> 16) & FRAME_MASK) as u32,
                var_id: (raw & VAR_MASK) as u32,
            })
        } else {
            Some(VarRef::Scope { frame_id: raw as u32 })
        }
    }
}

/// Reduce a raw remote variable record to its display value and packed
/// reference. An explicit `value` wins outright; otherwise inline `data`
/// is stringified; otherwise the variable is lazily expandable and gets a
/// placeholder label plus a non-zero reference.
pub fn render_variable(frame_id: u32, var: &RawVariable) -> (String, i64) {
    if let Some(value) = &var.value {
        return (value.clone(), 0);
    }
    if let Some(data) = &var.data {
        return (stringify(data), 0);
    }
    let ty = var.ty.as_deref().unwrap_or("unknown");
    let reference = match var.id {
        Some(var_id) => VarRef::Variable { frame_id, var_id }.pack(),
        None => 0,
    };
    (format!("form<{ty}>"), reference)
}

fn stringify(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_reference_round_trip() {
        let reference = VarRef::Variable {
            frame_id: 5,
            var_id: 42,
        }
        .pack();
        assert_eq!(
            VarRef::unpack(reference),
            Some(VarRef::Variable {
                frame_id: 5,
                var_id: 42
            })
        );
    }

    #[test]
    fn zero_is_never_expandable() {
        assert_eq!(VarRef::unpack(0), None);
    }

    #[test]
    fn scope_references_are_plain_frame_ids() {
        let reference = VarRef::Scope { frame_id: 3 }.pack();
        assert_eq!(reference, 3);
        assert_eq!(VarRef::unpack(3), Some(VarRef::Scope { frame_id: 3 }));
    }

    #[test]
    fn frame_id_truncates_to_14_bits() {
        let packed = VarRef::Variable {
            frame_id: 0x7FFF,
            var_id: 1,
        }
        .pack();
        assert_eq!(
            VarRef::unpack(packed),
            Some(VarRef::Variable {
                frame_id: 0x3FFF,
                var_id: 1
            })
        );
    }

    #[test]
    fn display_precedence() {
        let explicit = RawVariable {
            name: "x".into(),
            id: Some(9),
            ty: Some("int".into()),
            value: Some("12".into()),
            data: Some(serde_json::json!(99)),
        };
        assert_eq!(render_variable(1, &explicit), ("12".to_string(), 0));

        let inline = RawVariable {
            name: "y".into(),
            id: Some(9),
            ty: Some("int".into()),
            value: None,
            data: Some(serde_json::json!(99)),
        };
        assert_eq!(render_variable(1, &inline), ("99".to_string(), 0));

        let lazy = RawVariable {
            name: "t".into(),
            id: Some(7),
            ty: Some("table".into()),
            value: None,
            data: None,
        };
        let (label, reference) = render_variable(2, &lazy);
        assert_eq!(label, "form<table>");
        assert_eq!(
            VarRef::unpack(reference),
            Some(VarRef::Variable {
                frame_id: 2,
                var_id: 7
            })
        );
    }
}
