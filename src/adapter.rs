//! Helpers that let blocking and awaitable callables be used interchangeably.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

/// Plain callable shared between attempts
pub type BlockingFn<A, O> = Arc<dyn Fn(A) -> O + Send + Sync>;

/// Callable producing a boxed future
pub type AsyncFn<A, O> = Arc<dyn Fn(A) -> BoxFuture<'static, O> + Send + Sync>;

/// A configured callable, either blocking or awaitable-producing
pub enum Callable<A, O> {
    Blocking(BlockingFn<A, O>),
    Awaitable(AsyncFn<A, O>),
}

impl<A, O> Clone for Callable<A, O> {
    fn clone(&self) -> Self {
        match self {
            Self::Blocking(f) => Self::Blocking(Arc::clone(f)),
            Self::Awaitable(f) => Self::Awaitable(Arc::clone(f)),
        }
    }
}

impl<A, O> std::fmt::Debug for Callable<A, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("Callable::Blocking"),
            Self::Awaitable(_) => f.write_str("Callable::Awaitable"),
        }
    }
}

impl<A: Send + 'static, O: Send + 'static> Callable<A, O> {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(A) -> O + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    pub fn awaitable<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        Self::Awaitable(Arc::new(move |arg| f(arg).boxed()))
    }

    pub fn is_awaitable(&self) -> bool {
        matches!(self, Self::Awaitable(_))
    }

    /// Converts into an awaitable-producing function.
    ///
    /// Awaitable callables are returned as they are. Blocking callables are
    /// wrapped so that the call happens when the future is first polled.
    pub fn into_async(self) -> AsyncFn<A, O> {
        match self {
            Self::Awaitable(f) => f,
            Self::Blocking(f) => Arc::new(move |arg| {
                let f = Arc::clone(&f);
                async move { f(arg) }.boxed()
            }),
        }
    }
}

/// Returns an awaitable-producing equivalent of `callable`.
///
/// Wrapping twice is the same as wrapping once.
pub fn to_async<A, O>(callable: Callable<A, O>) -> Callable<A, O>
where
    A: Send + 'static,
    O: Send + 'static,
{
    Callable::Awaitable(callable.into_async())
}

/// A value or a zero-argument producer of it
pub enum Source<V> {
    Value(Arc<V>),
    Producer(BlockingFn<(), anyhow::Result<V>>),
}

impl<V> Clone for Source<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(v) => Self::Value(Arc::clone(v)),
            Self::Producer(f) => Self::Producer(Arc::clone(f)),
        }
    }
}

impl<V: Send + Sync + 'static> Source<V> {
    pub fn value(value: V) -> Self {
        Self::Value(Arc::new(value))
    }

    pub fn producer<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<V> + Send + Sync + 'static,
    {
        Self::Producer(Arc::new(move |()| f()))
    }

    pub fn is_invocable(&self) -> bool {
        matches!(self, Self::Producer(_))
    }

    /// Returns the value unchanged, or invokes the producer.
    pub fn extract(&self) -> anyhow::Result<Arc<V>> {
        match self {
            Self::Value(v) => Ok(Arc::clone(v)),
            Self::Producer(f) => f(()).map(Arc::new),
        }
    }
}

/// Awaitable counterpart of [`Source`]
pub enum AsyncSource<V> {
    Value(Arc<V>),
    Producer(AsyncFn<(), anyhow::Result<V>>),
}

impl<V> Clone for AsyncSource<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(v) => Self::Value(Arc::clone(v)),
            Self::Producer(f) => Self::Producer(Arc::clone(f)),
        }
    }
}

impl<V: Send + Sync + 'static> AsyncSource<V> {
    pub fn value(value: V) -> Self {
        Self::Value(Arc::new(value))
    }

    /// Accepts both blocking and awaitable producers
    pub fn producer(producer: Callable<(), anyhow::Result<V>>) -> Self {
        Self::Producer(producer.into_async())
    }

    pub async fn extract(&self) -> anyhow::Result<Arc<V>> {
        match self {
            Self::Value(v) => Ok(Arc::clone(v)),
            Self::Producer(f) => f(()).await.map(Arc::new),
        }
    }
}

impl<V: Send + Sync + 'static> From<Source<V>> for AsyncSource<V> {
    fn from(source: Source<V>) -> Self {
        match source {
            Source::Value(v) => Self::Value(v),
            Source::Producer(f) => Self::Producer(Callable::Blocking(f).into_async()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_blocking_callable_becomes_awaitable() {
        let double = Callable::blocking(|x: u32| x * 2).into_async();
        assert_eq!(double(21).await, 42);
    }

    #[tokio::test]
    async fn test_wrapped_call_is_deferred_until_polled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let f = Callable::blocking(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .into_async();

        let fut = f(());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        fut.await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_to_async_is_idempotent() {
        let once = to_async(Callable::blocking(|x: u32| x + 1));
        let Callable::Awaitable(first) = once.clone() else {
            panic!("expected awaitable");
        };
        let Callable::Awaitable(second) = to_async(once) else {
            panic!("expected awaitable");
        };
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_awaitable_is_not_rewrapped() {
        let f = Callable::awaitable(|x: u32| async move { x + 1 });
        assert!(f.is_awaitable());
        assert_eq!(f.into_async()(1).await, 2);
    }

    #[test]
    fn test_source_value_is_shared() {
        let source = Source::value(String::from("session"));
        assert!(!source.is_invocable());
        let a = source.extract().unwrap();
        let b = source.extract().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_source_producer_is_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let source = Source::producer(move || Ok(counter.fetch_add(1, Ordering::SeqCst)));
        assert!(source.is_invocable());
        assert_eq!(*source.extract().unwrap(), 0);
        assert_eq!(*source.extract().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_async_source_awaits_producer() {
        let source: AsyncSource<u8> =
            AsyncSource::producer(Callable::awaitable(|()| async { Ok::<_, anyhow::Error>(7) }));
        assert_eq!(*source.extract().await.unwrap(), 7);

        let converted: AsyncSource<u8> = Source::producer(|| Ok(3)).into();
        assert_eq!(*converted.extract().await.unwrap(), 3);
    }
}
