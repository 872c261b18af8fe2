//! Reference extraction from canonical forms
//!
//! A reference is a global name. Calls through an attribute, such as
//! `module.f()` or `obj.method()`, load the global `module` or `obj` and are
//! never references themselves: a change to `module.f` does not reach callers
//! that only call it through the module object. Bind the function directly
//! (`from module import f`) for it to count. In
//! [`ReferenceMode::AllGlobals`] the module name itself is still followed.

use crate::model::{CanonicalForm, Constant, Op};
use serde::{Deserialize, Serialize};

/// Classifies names that denote opaque built-in primitives.
pub trait PrimitiveOracle {
    fn is_primitive(&self, name: &str) -> bool;
}

impl<F> PrimitiveOracle for F
where
    F: Fn(&str) -> bool,
{
    fn is_primitive(&self, name: &str) -> bool {
        self(name)
    }
}

/// Oracle that treats nothing as primitive.
pub struct NoPrimitives;

impl PrimitiveOracle for NoPrimitives {
    fn is_primitive(&self, _name: &str) -> bool {
        false
    }
}

/// Which global loads count as references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceMode {
    /// Only names in calling position.
    #[default]
    Calls,
    /// Every global name loaded, called or passed as a value.
    AllGlobals,
}

/// Distinct global names referenced by `form`, in first-appearance order.
///
/// Nested function bodies contribute their references to the enclosing unit.
/// Local bindings never appear because they are loaded through slot ops.
pub fn extract_references(
    form: &CanonicalForm,
    oracle: &dyn PrimitiveOracle,
    mode: ReferenceMode,
) -> Vec<String> {
    let mut found = Vec::new();
    collect(form, oracle, mode, &mut found);
    found
}

fn collect(
    form: &CanonicalForm,
    oracle: &dyn PrimitiveOracle,
    mode: ReferenceMode,
    found: &mut Vec<String>,
) {
    let mut push = |index: u32| {
        let Some(name) = form.names.get(index as usize) else {
            tracing::warn!("LoadGlobal({}) out of range for name table", index);
            return;
        };
        if !oracle.is_primitive(name) && !found.iter().any(|n| n == name) {
            found.push(name.clone());
        }
    };

    for (i, op) in form.ops.iter().enumerate() {
        match (mode, op) {
            (ReferenceMode::AllGlobals, Op::LoadGlobal(index)) => push(*index),
            (ReferenceMode::Calls, Op::Call { .. }) => {
                if let Some(Op::LoadGlobal(index)) = form.ops.get(i + 1) {
                    push(*index);
                }
            }
            _ => {}
        }
    }

    for constant in &form.constants {
        if let Constant::Code(nested) = constant {
            collect(nested, oracle, mode, found);
        }
    }
}
