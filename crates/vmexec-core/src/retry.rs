//! Exponential-backoff retry helper for flaky external-binary calls (most
//! notably the container runtime's `create`/`export` pair, which can race
//! a concurrent image pull).

use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;

/// Call `f` up to `max_attempts` times, doubling the delay after each
/// failure starting from `base_delay`. Returns the first `Ok`, or the last
/// `Err` if every attempt fails. `label` is logged with each retry so
/// failures are traceable to the operation that produced them.
pub fn retry<F, T>(max_attempts: u32, base_delay: Duration, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "{label} failed, retrying"
                );
                sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retry_succeeds_on_second_attempt() {
        let calls = Cell::new(0);
        let result = retry(3, Duration::from_millis(1), "flaky", || {
            let n = calls.get() + 1;
            calls.set(n);
            if n < 2 {
                anyhow::bail!("not yet")
            } else {
                Ok(n)
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_retry_exhausts_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = retry(3, Duration::from_millis(1), "always-fails", || {
            calls.set(calls.get() + 1);
            anyhow::bail!("nope")
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_succeeds_immediately_without_sleeping() {
        let result = retry(5, Duration::from_secs(60), "fast", || Ok::<_, anyhow::Error>(42));
        assert_eq!(result.unwrap(), 42);
    }
}
