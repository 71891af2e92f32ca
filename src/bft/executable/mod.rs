//! Application execution: the `Service` contract implemented by
//! whatever is being replicated, and the executor that runs accepted
//! operations against it off the single-threaded consensus actor.

pub mod kv_demo;

use std::sync::mpsc as std_mpsc;
use std::thread;

use tokio::sync::mpsc as tokio_mpsc;

use crate::bft::communication::serialize::SharedData;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;

/// A single client update request, to be executed against the
/// application state.
#[derive(Clone)]
pub struct Update<O> {
    from: NodeId,
    digest: Digest,
    operation: O,
}

/// A single client update reply.
#[derive(Clone)]
pub struct UpdateReply<P> {
    to: NodeId,
    digest: Digest,
    payload: P,
}

/// A batch of client update requests to be executed, in order.
#[derive(Clone)]
pub struct UpdateBatch<O> {
    inner: Vec<Update<O>>,
}

/// A batch of client update replies.
#[derive(Clone)]
pub struct UpdateBatchReplies<P> {
    inner: Vec<UpdateReply<P>>,
}

/// The outcome of executing a batch: replies to deliver to clients,
/// and optionally a fresh application-state snapshot (taken when the
/// batch crosses a checkpoint boundary).
pub enum ExecutionResult<S, P> {
    Replies(UpdateBatchReplies<P>),
    RepliesAndAppstate(UpdateBatchReplies<P>, S, Digest),
}

enum ExecutionRequest<S, O> {
    InstallState(S, Vec<O>),
    Update(UpdateBatch<O>),
    UpdateAndGetAppstate(UpdateBatch<O>),
    /// Asks for a copy of the current application state and its
    /// digest, without touching it. Used to serve an incoming
    /// `GET_STATE` during state transfer.
    ExportState(tokio::sync::oneshot::Sender<(S, Digest)>),
}

/// State type of a `Service`.
pub type State<S> = <<S as Service>::Data as SharedData>::State;
/// Request type of a `Service`.
pub type Request<S> = <<S as Service>::Data as SharedData>::Request;
/// Reply type of a `Service`.
pub type Reply<S> = <<S as Service>::Data as SharedData>::Reply;

/// The application logic being replicated.
///
/// Beyond the teacher's original `initial_state`/`update` pair, this
/// contract also asks the application for a digest of its own state
/// (used to certify that every replica executing the same prefix of
/// operations ends up byte-for-byte identical) and a hook to
/// compact its log once a checkpoint makes everything before it
/// irrelevant.
pub trait Service {
    /// The application's state/request/reply types and their
    /// (de)serialization routines.
    type Data: SharedData;

    /// Returns the application's initial state.
    fn initial_state(&mut self) -> Result<State<Self>>;

    /// Executes `request` against `state`, producing a reply and
    /// mutating `state` in place.
    fn update(&mut self, state: &mut State<Self>, request: Request<Self>) -> Reply<Self>;

    /// Returns a content digest of `state`, used to certify that every
    /// correct replica that has executed the same sequence of
    /// operations holds byte-for-byte identical state.
    fn service_state_hash(&self, state: &State<Self>) -> Result<Digest> {
        let mut buf = Vec::new();
        <Self::Data as SharedData>::serialize_state(&mut buf, state)?;
        Ok(crate::bft::crypto::hash::digest(&buf))
    }

    /// Invoked once a checkpoint over `state` becomes stable, giving
    /// the application a chance to compact whatever internal log or
    /// index it keeps, now that no earlier operation will ever need
    /// to be replayed again.
    ///
    /// The default implementation does nothing: services with no log
    /// of their own besides `state` itself have nothing to compact.
    fn consolidate_log(&mut self, _state: &mut State<Self>) -> Result<()> {
        Ok(())
    }
}

/// Stateful data of the thread responsible for executing client
/// requests, kept off the single-threaded consensus actor so a slow
/// application `update` call never stalls message processing.
pub struct Executor<S: Service> {
    service: S,
    state: State<S>,
    e_rx: std_mpsc::Receiver<ExecutionRequest<State<S>, Request<S>>>,
    result_tx: tokio_mpsc::Sender<ExecutionResult<State<S>, Reply<S>>>,
}

/// A handle to the client request executor.
pub struct ExecutorHandle<S: Service> {
    e_tx: std_mpsc::Sender<ExecutionRequest<State<S>, Request<S>>>,
}

impl<S: Service> Clone for ExecutorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            e_tx: self.e_tx.clone(),
        }
    }
}

impl<S: Service> ExecutorHandle<S>
where
    S: Send + 'static,
    Request<S>: Send + 'static,
    Reply<S>: Send + 'static,
{
    /// Replaces the application state wholesale (used by state
    /// transfer), then replays `after` on top of it.
    pub fn install_state(&self, state: State<S>, after: Vec<Request<S>>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::InstallState(state, after))
            .simple(ErrorKind::Executable)
    }

    /// Queues `batch` for execution.
    pub fn queue_update(&self, batch: UpdateBatch<Request<S>>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::Update(batch))
            .simple(ErrorKind::Executable)
    }

    /// Same as [`queue_update`](Self::queue_update), additionally
    /// reporting the post-execution application state, for use at a
    /// checkpoint boundary.
    pub fn queue_update_and_get_appstate(&self, batch: UpdateBatch<Request<S>>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::UpdateAndGetAppstate(batch))
            .simple(ErrorKind::Executable)
    }

    /// Requests a copy of the current application state and its
    /// digest, for serving an incoming `GET_STATE`.
    pub fn export_state(&self) -> Result<tokio::sync::oneshot::Receiver<(State<S>, Digest)>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.e_tx
            .send(ExecutionRequest::ExportState(tx))
            .simple(ErrorKind::Executable)?;
        Ok(rx)
    }
}

impl<S> Executor<S>
where
    S: Service + Send + 'static,
    State<S>: Send + Clone + 'static,
    Request<S>: Send + 'static,
    Reply<S>: Send + 'static,
{
    /// Spawns the executor onto its own OS thread, returning a handle
    /// used to feed it work, and the receiving half of the channel its
    /// results are delivered on.
    pub fn new(
        mut service: S,
    ) -> Result<(ExecutorHandle<S>, tokio_mpsc::Receiver<ExecutionResult<State<S>, Reply<S>>>)> {
        let (e_tx, e_rx) = std_mpsc::channel();
        let (result_tx, result_rx) = tokio_mpsc::channel(128);

        let state = service.initial_state()?;
        let mut exec = Executor {
            e_rx,
            result_tx,
            service,
            state,
        };

        thread::spawn(move || {
            while let Ok(exec_req) = exec.e_rx.recv() {
                match exec_req {
                    ExecutionRequest::InstallState(checkpoint, after) => {
                        exec.state = checkpoint;
                        for req in after {
                            exec.service.update(&mut exec.state, req);
                        }
                    }
                    ExecutionRequest::Update(batch) => {
                        let mut reply_batch = UpdateBatchReplies::with_capacity(batch.len());
                        for update in batch.into_inner() {
                            let (peer_id, dig, req) = update.into_inner();
                            let reply = exec.service.update(&mut exec.state, req);
                            reply_batch.add(peer_id, dig, reply);
                        }
                        let _ = exec.result_tx.blocking_send(ExecutionResult::Replies(reply_batch));
                    }
                    ExecutionRequest::UpdateAndGetAppstate(batch) => {
                        let mut reply_batch = UpdateBatchReplies::with_capacity(batch.len());
                        for update in batch.into_inner() {
                            let (peer_id, dig, req) = update.into_inner();
                            let reply = exec.service.update(&mut exec.state, req);
                            reply_batch.add(peer_id, dig, reply);
                        }
                        let _ = exec.service.consolidate_log(&mut exec.state);
                        let digest = exec
                            .service
                            .service_state_hash(&exec.state)
                            .unwrap_or_else(|_| Digest::from_bytes(&[0; Digest::LENGTH]).unwrap());
                        let cloned_state = exec.state.clone();
                        let _ = exec.result_tx.blocking_send(ExecutionResult::RepliesAndAppstate(
                            reply_batch,
                            cloned_state,
                            digest,
                        ));
                    }
                    ExecutionRequest::ExportState(reply) => {
                        let _ = reply.send((exec.state.clone(), {
                            exec.service
                                .service_state_hash(&exec.state)
                                .unwrap_or_else(|_| Digest::from_bytes(&[0; Digest::LENGTH]).unwrap())
                        }));
                    }
                }
            }
        });

        Ok((ExecutorHandle { e_tx }, result_rx))
    }
}

impl<O> UpdateBatch<O> {
    pub fn new() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn add(&mut self, from: NodeId, digest: Digest, operation: O) {
        self.inner.push(Update {
            from,
            digest,
            operation,
        });
    }

    pub fn into_inner(self) -> Vec<Update<O>> {
        self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<O> Default for UpdateBatch<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> AsRef<[Update<O>]> for UpdateBatch<O> {
    fn as_ref(&self) -> &[Update<O>] {
        &self.inner[..]
    }
}

impl<O> Update<O> {
    pub fn into_inner(self) -> (NodeId, Digest, O) {
        (self.from, self.digest, self.operation)
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }
}

impl<P> UpdateBatchReplies<P> {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            inner: Vec::with_capacity(n),
        }
    }

    pub fn add(&mut self, to: NodeId, digest: Digest, payload: P) {
        self.inner.push(UpdateReply { to, digest, payload });
    }

    pub fn into_inner(self) -> Vec<UpdateReply<P>> {
        self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<P> UpdateReply<P> {
    pub fn into_inner(self) -> (NodeId, Digest, P) {
        (self.to, self.digest, self.payload)
    }
}
