//! The messaging substrate the protocol runs on.
//!
//! The manager and every worker hold one [`Communicator`] each, addressed by
//! rank. Collectives (`broadcast`, `scatter`, `gather`, `barrier`) block
//! until the whole grid participates; the point-to-point half is
//! non-blocking and returns tickets that are awaited later. Sends and
//! receives are paired by `(peer, tag)` and delivery is FIFO per
//! `(source, destination, tag)`, so a length leg can never overtake its data
//! leg and two particles in flight between the same pair of ranks can never
//! cross-match.

use tokio::sync::oneshot;

use crate::error::Error;

pub mod local;

/// Identifies one process within the grid.
pub type Rank = u32;

/// Pairs a send with its matching receive. The resample protocol uses the
/// particle index as the tag.
pub type Tag = u64;

#[allow(async_fn_in_trait)]
pub trait Communicator: Send + Sync {
    fn rank(&self) -> Rank;

    /// Number of ranks in the grid, manager included.
    fn size(&self) -> u32;

    /// Root passes `Some(payload)`; everyone gets the payload back.
    async fn broadcast(&self, root: Rank, payload: Option<Vec<u8>>) -> Result<Vec<u8>, Error>;

    /// Root passes one part per rank (its own included); everyone gets
    /// their part back.
    async fn scatter(&self, root: Rank, parts: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>, Error>;

    /// Everyone contributes a part; the root gets them back indexed by rank.
    async fn gather(&self, root: Rank, part: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, Error>;

    async fn barrier(&self) -> Result<(), Error>;

    /// Non-blocking tagged send. Never blocks; completion is observed by
    /// awaiting the ticket.
    fn isend(&self, payload: Vec<u8>, dest: Rank, tag: Tag) -> Result<SendTicket, Error>;

    /// Non-blocking tagged receive from a specific peer.
    fn irecv(&self, source: Rank, tag: Tag) -> Result<RecvTicket, Error>;
}

enum Ticket<T> {
    Ready(Result<T, Error>),
    Pending(oneshot::Receiver<Result<T, Error>>),
}

impl<T> Ticket<T> {
    async fn wait(self, what: &'static str) -> Result<T, Error> {
        match self {
            Ticket::Ready(result) => result,
            Ticket::Pending(rx) => rx.await.map_err(|_| Error::ChannelClosed(what))?,
        }
    }
}

/// Handle to an in-flight send. The payload was handed to the substrate when
/// the ticket was issued; waiting confirms it is out of the sender's hands.
pub struct SendTicket(Ticket<()>);

impl SendTicket {
    pub fn completed() -> Self {
        Self(Ticket::Ready(Ok(())))
    }

    pub fn pending(rx: oneshot::Receiver<Result<(), Error>>) -> Self {
        Self(Ticket::Pending(rx))
    }

    pub async fn wait(self) -> Result<(), Error> {
        self.0.wait("send ticket").await
    }
}

/// Handle to an in-flight receive; resolves to the matched payload.
pub struct RecvTicket(Ticket<Vec<u8>>);

impl RecvTicket {
    pub fn ready(payload: Vec<u8>) -> Self {
        Self(Ticket::Ready(Ok(payload)))
    }

    pub fn pending(rx: oneshot::Receiver<Result<Vec<u8>, Error>>) -> Self {
        Self(Ticket::Pending(rx))
    }

    pub async fn wait(self) -> Result<Vec<u8>, Error> {
        self.0.wait("receive ticket").await
    }
}
