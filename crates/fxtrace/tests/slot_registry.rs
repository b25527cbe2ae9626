use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use fxtrace::ir::Graph;
use fxtrace::tracer::{OverwritePolicy, Slot, SlotRef, SlotRegistry, TensorSlot, Thunk};
use fxtrace::value::{OpaqueRef, SymKind, Symbol};
use fxtrace::{Literal, Proxy, SymScalar, TensorRef, TraceError, TraceResult, Value};
use proptest::prelude::*;

fn proxies(count: usize) -> Vec<Proxy> {
    let mut graph = Graph::new();
    (0..count)
        .map(|i| Proxy::new(graph.placeholder(&format!("p{i}"))))
        .collect()
}

fn tensor() -> TensorRef {
    TensorRef::from_f32(&[1], vec![0.0]).expect("valid tensor")
}

fn proxy_of(registry: &SlotRegistry, value: &Value) -> TraceResult<Option<Proxy>> {
    registry.lookup(value, None, |slot| match slot {
        SlotRef::Tensor(slot) => Some(slot.proxy),
        SlotRef::Sym(thunk) => thunk.force().ok(),
        SlotRef::Opaque(proxy) => Some(proxy),
    })
}

#[test]
fn tensors_are_last_wins_and_symbols_first_wins() -> Result<()> {
    let p = proxies(4);
    let mut registry = SlotRegistry::new();

    let t = tensor();
    registry.bind_tensor(&t, TensorSlot::new(p[0], None));
    registry.bind_tensor(&t, TensorSlot::new(p[1], None));
    assert_eq!(proxy_of(&registry, &t.clone().into())?, Some(p[1]));

    let s = SymScalar::symbol(Symbol::new("s0"), SymKind::Int, Some(Literal::Int(3)));
    assert!(registry.bind_sym(&s, Rc::new(Thunk::ready(p[2]))));
    assert!(!registry.bind_sym(&s.rewrap(), Rc::new(Thunk::ready(p[3]))));
    assert_eq!(proxy_of(&registry, &Value::Sym(s.rewrap()))?, Some(p[2]));

    assert_eq!(SlotRegistry::policy_for(&t.into()), Some(OverwritePolicy::LastWins));
    assert_eq!(SlotRegistry::policy_for(&Value::Sym(s)), Some(OverwritePolicy::FirstWins));
    assert_eq!(SlotRegistry::policy_for(&Value::from(1_i64)), None);
    Ok(())
}

#[test]
fn lookup_misses_use_the_default_or_fail() -> Result<()> {
    let registry = SlotRegistry::new();
    let stray: Value = tensor().into();
    assert_eq!(registry.lookup(&stray, Some(7), |_| 0)?, 7);
    assert!(matches!(registry.lookup(&stray, None, |_| 0), Err(TraceError::Tracking(_))));
    assert!(!registry.is_bound(&Value::from(1.5)));
    Ok(())
}

#[test]
fn mismatched_slot_kinds_are_rejected() -> Result<()> {
    let p = proxies(1);
    let mut registry = SlotRegistry::new();
    let handle = OpaqueRef::new("ScriptObject", 42_u32);

    let err = registry
        .bind(&Value::Opaque(handle.clone()), Slot::Tensor(TensorSlot::new(p[0], None)))
        .unwrap_err();
    assert!(matches!(err, TraceError::Tracking(_)), "{err}");
    assert!(registry.is_empty());

    assert!(registry.bind(&Value::Opaque(handle.clone()), Slot::Opaque(p[0]))?);
    assert_eq!(registry.opaque(&handle), Some(p[0]));
    assert_eq!(registry.len(), 1);
    Ok(())
}

#[test]
fn thunks_run_their_computation_once() -> Result<()> {
    let runs = Rc::new(Cell::new(0));
    let counter = Rc::clone(&runs);
    let thunk = Thunk::new(move || {
        counter.set(counter.get() + 1);
        Ok(11)
    });
    assert!(!thunk.is_forced());
    assert_eq!(thunk.force()?, 11);
    assert_eq!(thunk.force()?, 11);
    assert!(thunk.is_forced());
    assert_eq!(runs.get(), 1);
    Ok(())
}

#[test]
fn failed_thunks_stay_failed() {
    let thunk: Thunk<i64> = Thunk::new(|| Err(TraceError::tracking("boom")));
    assert!(matches!(thunk.force(), Err(TraceError::Tracking(ref msg)) if msg == "boom"));
    let again = thunk.force().unwrap_err();
    assert!(again.to_string().contains("failed"), "{again}");
}

#[test]
fn reentrant_forcing_is_an_error() {
    let slot: Rc<std::cell::RefCell<Option<Rc<Thunk<i64>>>>> = Rc::default();
    let inner = Rc::clone(&slot);
    let thunk = Rc::new(Thunk::new(move || {
        let this = inner.borrow().clone().expect("thunk installed");
        this.force().map(|v| v + 1)
    }));
    *slot.borrow_mut() = Some(Rc::clone(&thunk));

    let err = thunk.force().unwrap_err();
    assert!(err.to_string().contains("being computed"), "{err}");
    slot.borrow_mut().take();
}

#[derive(Clone, Debug)]
enum Bind {
    Tensor { value: usize, proxy: usize },
    Sym { value: usize, proxy: usize },
}

fn bind_strategy() -> impl Strategy<Value = Bind> {
    prop_oneof![
        (0..3usize, 0..8usize).prop_map(|(value, proxy)| Bind::Tensor { value, proxy }),
        (0..3usize, 0..8usize).prop_map(|(value, proxy)| Bind::Sym { value, proxy }),
    ]
}

proptest! {
    #[test]
    fn bindings_follow_their_overwrite_policy(
        binds in proptest::collection::vec(bind_strategy(), 0..24)
    ) {
        let p = proxies(8);
        let tensors = (0..3).map(|_| tensor()).collect::<Vec<_>>();
        let syms = (0..3)
            .map(|i| {
                SymScalar::symbol(Symbol::new(format!("s{i}")), SymKind::Int, Some(Literal::Int(2)))
            })
            .collect::<Vec<_>>();

        let mut registry = SlotRegistry::new();
        let mut expected_tensors = HashMap::new();
        let mut expected_syms = HashMap::new();
        for bind in &binds {
            match *bind {
                Bind::Tensor { value, proxy } => {
                    registry.bind_tensor(&tensors[value], TensorSlot::new(p[proxy], None));
                    expected_tensors.insert(value, p[proxy]);
                }
                Bind::Sym { value, proxy } => {
                    let thunk = Rc::new(Thunk::ready(p[proxy]));
                    let fresh = registry.bind_sym(&syms[value].rewrap(), thunk);
                    prop_assert_eq!(fresh, !expected_syms.contains_key(&value));
                    expected_syms.entry(value).or_insert(p[proxy]);
                }
            }
        }

        for (i, t) in tensors.iter().enumerate() {
            let got = registry.tensor(t).map(|slot| slot.proxy);
            prop_assert_eq!(got, expected_tensors.get(&i).copied());
        }
        for (i, s) in syms.iter().enumerate() {
            let got = registry.sym(s).map(|thunk| thunk.force()).transpose();
            prop_assert!(got.is_ok());
            prop_assert_eq!(got.ok().flatten(), expected_syms.get(&i).copied());
        }
        prop_assert_eq!(registry.len(), expected_tensors.len() + expected_syms.len());
    }
}
