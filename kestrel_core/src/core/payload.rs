use crate::error::{KernelError, KernelResult};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Type-erased payload value
pub type PayloadValue = Box<dyn Any + Send + Sync>;

/// Custom release function, called once with the value when the last
/// reference goes away
pub type Releaser = Box<dyn FnOnce(PayloadValue) + Send>;

struct PayloadSlot {
    value: Option<PayloadValue>,
    releaser: Option<Releaser>,
}

struct PayloadInner {
    refs: AtomicUsize,
    slot: Mutex<PayloadSlot>,
}

/// Reference-counted event payload
///
/// Each `Payload` value owns exactly one reference. [`acquire`](Self::acquire)
/// hands out another one, [`release`](Self::release) (or dropping the handle)
/// gives it back. When the count reaches zero the value is passed to the
/// registered releaser, or simply dropped when there is none.
///
/// The event bus acquires one reference per delivered subscriber before
/// calling its handler; the handler owns that reference and must let go of
/// it exactly once. A handler that leaks its handle (for example with
/// `std::mem::forget`) keeps the payload alive for the life of the process.
///
/// Acquiring from a payload whose count already reached zero is rejected with
/// `InvalidState`. With safe code every live handle holds a reference, so this
/// can only be observed through a forged handle.
pub struct Payload {
    inner: Arc<PayloadInner>,
}

impl Payload {
    /// Wrap a value with count 1
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_parts(Box::new(value), None)
    }

    /// Wrap a value with count 1 and a custom releaser
    pub fn with_releaser<T, F>(value: T, releaser: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce(PayloadValue) + Send + 'static,
    {
        Self::from_parts(Box::new(value), Some(Box::new(releaser)))
    }

    fn from_parts(value: PayloadValue, releaser: Option<Releaser>) -> Self {
        Self {
            inner: Arc::new(PayloadInner {
                refs: AtomicUsize::new(1),
                slot: Mutex::new(PayloadSlot {
                    value: Some(value),
                    releaser,
                }),
            }),
        }
    }

    /// Take one more reference
    pub fn acquire(&self) -> KernelResult<Payload> {
        self.inner
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map_err(|_| KernelError::invalid_state("payload already released"))?;

        Ok(Payload {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Give this reference back
    pub fn release(self) {
        drop(self);
    }

    /// Current number of outstanding references
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Borrow the value as `T`; `None` if the type does not match
    pub fn with_value<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = self.inner.slot.lock();
        slot.value.as_ref()?.downcast_ref::<T>().map(f)
    }

    pub fn is<T: Any>(&self) -> bool {
        self.with_value::<T, _>(|_| ()).is_some()
    }

    /// Cloned copy of the value, when `T: Clone`
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.with_value(|v: &T| v.clone())
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let (value, releaser) = {
            let mut slot = self.inner.slot.lock();
            (slot.value.take(), slot.releaser.take())
        };
        if let Some(value) = value {
            match releaser {
                Some(release) => release(value),
                None => drop(value),
            }
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_acquire_release_counts() {
        let payload = Payload::new(42u32);
        assert_eq!(payload.ref_count(), 1);

        let second = payload.acquire().unwrap();
        let third = second.acquire().unwrap();
        assert_eq!(payload.ref_count(), 3);

        second.release();
        third.release();
        assert_eq!(payload.ref_count(), 1);
        assert_eq!(payload.get::<u32>(), Some(42));
    }

    #[test]
    fn test_releaser_runs_once_at_zero() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let payload = Payload::with_releaser(String::from("reading"), move |value| {
            assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("reading"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let extra = payload.acquire().unwrap();
        payload.release();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        extra.release();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_release_drops_value() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let payload = Payload::new(Flag(dropped.clone()));
        assert!(!dropped.load(Ordering::SeqCst));
        drop(payload);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wrong_type_is_none() {
        let payload = Payload::new(1.5f32);
        assert!(payload.is::<f32>());
        assert_eq!(payload.get::<u8>(), None);
    }
}
