//! Sample function artifact.
//!
//! Build with `cargo build -p fnhost-hello`, then run it through the host:
//!
//! ```text
//! fnhost run target/debug/libfnhost_hello.so hello.Hello --input '{"name":"World"}'
//! ```

use std::time::{Duration, Instant};

use fnhost_guest::{GuestContext, GuestError, GuestFunction, Input, Value};

/// Greets `input.name`.
#[derive(Default)]
pub struct Hello;

impl GuestFunction for Hello {
    fn handle(&mut self, input: Input, _ctx: &GuestContext<'_>) -> Result<Value, GuestError> {
        let name = input
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GuestError::new("validation", "missing string field `name`"))?;
        Ok(Value::from(format!("Hello, {name}")))
    }
}

/// Sleeps for `input.millis`, waking every 10ms to honor cancellation.
#[derive(Default)]
pub struct Sleepy;

impl GuestFunction for Sleepy {
    fn handle(&mut self, input: Input, ctx: &GuestContext<'_>) -> Result<Value, GuestError> {
        let millis = input.get("millis").and_then(Value::as_u64).unwrap_or(1_000);
        let until = Instant::now() + Duration::from_millis(millis);
        while Instant::now() < until {
            if ctx.is_cancelled() {
                return Err(GuestError::new("cancelled", "stopped by host"));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(Value::from(millis))
    }
}

/// Always panics; exercises panic containment across the ABI.
#[derive(Default)]
pub struct Explode;

impl GuestFunction for Explode {
    fn handle(&mut self, _input: Input, _ctx: &GuestContext<'_>) -> Result<Value, GuestError> {
        panic!("boom")
    }
}

fnhost_guest::export_functions! {
    "hello.Hello" => Hello,
    "hello.Sleepy" => Sleepy,
    "hello.Explode" => Explode,
}
