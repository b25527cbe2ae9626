use anyhow::Result;
use fxtrace::value::symbolic;
use fxtrace::value::SymOp;
use fxtrace::{TraceError, Value};

fn floor_div(a: i64, b: i64) -> fxtrace::TraceResult<Value> {
    symbolic::apply(SymOp::FloorDiv, &Value::from(a), &Value::from(b))
}

#[test]
fn floor_division_rounds_toward_negative_infinity() -> Result<()> {
    for (a, b, expected) in [(7, 2, 3), (-7, 2, -4), (7, -2, -4), (-7, -2, 3), (6, -3, -2)] {
        assert_eq!(floor_div(a, b)?.as_int(), Some(expected), "{a} // {b}");
    }
    Ok(())
}

#[test]
fn floor_division_reports_overflow_and_zero_divisors() {
    let err = floor_div(i64::MIN, -1).unwrap_err();
    assert!(matches!(err, TraceError::UnexpectedValue { .. }), "{err}");
    assert!(err.to_string().contains("//"), "{err}");

    let err = floor_div(1, 0).unwrap_err();
    assert!(err.to_string().contains("non-zero divisor"), "{err}");
}

#[test]
fn wrapping_operators_never_panic() -> Result<()> {
    let sum = symbolic::apply(SymOp::Add, &Value::from(i64::MAX), &Value::from(1_i64))?;
    assert_eq!(sum.as_int(), Some(i64::MIN));
    Ok(())
}
