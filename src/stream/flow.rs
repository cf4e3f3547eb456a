use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, warn};

/// Connects an upstream channel to a downstream one
pub trait Operator<In, Out>: Send + 'static {
    /// Start consuming `input`, returning the channel outputs are emitted on
    fn attach(self, input: mpsc::Receiver<In>, capacity: usize) -> mpsc::Receiver<Out>;
}

/// Terminal consumer of a flow
pub trait Sink<T>: Send + 'static {
    /// Drain `input` until it closes
    fn run(self, input: mpsc::Receiver<T>) -> JoinHandle<()>;
}

/// Upstream end of a chain of operators
pub struct Flow<T> {
    rx: mpsc::Receiver<T>,
    capacity: usize,
}

impl<T: Send + 'static> Flow<T> {
    pub fn new(rx: mpsc::Receiver<T>, capacity: usize) -> Self {
        Self {
            rx,
            capacity: capacity.max(1),
        }
    }

    /// Feed this flow into `operator`, which becomes the new upstream
    pub fn via<Out, O>(self, operator: O) -> Flow<Out>
    where
        Out: Send + 'static,
        O: Operator<T, Out>,
    {
        Flow {
            rx: operator.attach(self.rx, self.capacity),
            capacity: self.capacity,
        }
    }

    /// Terminate this flow in `sink`
    pub fn to<S: Sink<T>>(self, sink: S) -> JoinHandle<()> {
        sink.run(self.rx)
    }
}

/// One output (or none) per input, at most `parallelism` handlers in flight
pub struct Map<In, Out, F> {
    handler: Arc<F>,
    parallelism: usize,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F, Fut> Map<In, Out, F>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Out>> + Send + 'static,
{
    pub fn new(handler: F, parallelism: usize) -> Self {
        Self {
            handler: Arc::new(handler),
            parallelism,
            _types: PhantomData,
        }
    }
}

impl<In, Out, F, Fut> Operator<In, Out> for Map<In, Out, F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Out>> + Send + 'static,
{
    fn attach(self, input: mpsc::Receiver<In>, capacity: usize) -> mpsc::Receiver<Out> {
        spawn_pool(input, self.handler, self.parallelism, capacity)
    }
}

/// Zero or more outputs per input, each emitted individually
pub struct FlatMap<In, Out, F> {
    handler: Arc<F>,
    parallelism: usize,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F, Fut> FlatMap<In, Out, F>
where
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<Out>> + Send + 'static,
{
    pub fn new(handler: F, parallelism: usize) -> Self {
        Self {
            handler: Arc::new(handler),
            parallelism,
            _types: PhantomData,
        }
    }
}

impl<In, Out, F, Fut> Operator<In, Out> for FlatMap<In, Out, F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<Out>> + Send + 'static,
{
    fn attach(self, input: mpsc::Receiver<In>, capacity: usize) -> mpsc::Receiver<Out> {
        spawn_pool(input, self.handler, self.parallelism, capacity)
    }
}

/// Dispatch every input to `handler` on a pool bounded by `parallelism`.
///
/// The output channel closes once the input has closed and every in-flight
/// handler has finished. Completion order is not preserved.
fn spawn_pool<In, Out, F, Fut, I>(
    mut input: mpsc::Receiver<In>,
    handler: Arc<F>,
    parallelism: usize,
    capacity: usize,
) -> mpsc::Receiver<Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = I> + Send + 'static,
    I: IntoIterator<Item = Out> + Send + 'static,
    I::IntoIter: Send,
{
    let (tx, rx) = mpsc::channel(capacity);
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));

    tokio::spawn(async move {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
                item = input.recv() => {
                    let Some(item) = item else { break };

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Flow semaphore closed, dropping remaining input");
                            break;
                        }
                    };

                    let handler = Arc::clone(&handler);
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        for output in handler(item).await {
                            if tx.send(output).await.is_err() {
                                debug!("Downstream closed, discarding output");
                                break;
                            }
                        }
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    });

    rx
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Flow handler task failed: {}", e);
    }
}

/// Sink discarding everything, for stages without a downstream
pub struct IgnoreSink;

impl<T: Send + 'static> Sink<T> for IgnoreSink {
    fn run(self, mut input: mpsc::Receiver<T>) -> JoinHandle<()> {
        tokio::spawn(async move { while input.recv().await.is_some() {} })
    }
}
