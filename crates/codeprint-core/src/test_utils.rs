//! Test utilities for codeprint-core

use crate::model::*;
use crate::symbols::Environment;

/// `def f(x): callee_1(x); ...; return <marker>`
pub fn calls(callees: &[&str], marker: i128) -> CanonicalForm {
    let mut form = CanonicalForm::new(1);
    for callee in callees {
        let name = form.name(callee);
        form.push(Op::Discard);
        form.push(Op::Call { args: 1, keywords: 0 });
        form.push(Op::LoadGlobal(name));
        form.push(Op::LoadLocal(0));
    }
    let constant = form.constant(Constant::Int(marker));
    form.push(Op::Return);
    form.push(Op::LoadConst(constant));
    form
}

/// `def f(x): return <marker>`
pub fn leaf(marker: i128) -> CanonicalForm {
    calls(&[], marker)
}

/// `def f(x): return g` for each value name, without calling it.
pub fn passes(values: &[&str]) -> CanonicalForm {
    let mut form = CanonicalForm::new(1);
    for value in values {
        let name = form.name(value);
        form.push(Op::Return);
        form.push(Op::LoadGlobal(name));
    }
    form
}

/// Environment with the usual primitives installed.
pub fn environment() -> Environment {
    Environment::with_builtins(["len", "print", "range"])
}

/// `even`/`odd` mutually recursive pair in `scope`.
pub fn define_even_odd(env: &Environment, scope: &str) -> (UnitId, UnitId) {
    let even = env.define(scope, "even", calls(&["odd"], 1));
    let odd = env.define(scope, "odd", calls(&["even"], 2));
    (even, odd)
}
