use crate::{Comm, Envelope, Error, Tag};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use protocol::Rank;
use std::sync::{Arc, Barrier};

/// Grid is the in-process fabric: every rank of one job, backed by one
/// unbounded channel per rank. A single channel per destination preserves
/// exactly the MPI ordering contract the core relies on: FIFO from each
/// source, arbitrary interleaving across sources.
pub struct Grid;

impl Grid {
    /// Build endpoints for a world of `world` ranks. Endpoint `r` is for
    /// rank `r`; move each onto its own thread.
    pub fn new(world: u32) -> Vec<GridComm> {
        assert!(world > 0, "world must hold at least one rank");

        let mut senders = Vec::with_capacity(world as usize);
        let mut inboxes = Vec::with_capacity(world as usize);
        for _ in 0..world {
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.push(tx);
            inboxes.push(rx);
        }
        let barrier = Arc::new(Barrier::new(world as usize));

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| GridComm {
                rank: rank as Rank,
                world,
                senders: senders.clone(),
                inbox,
                barrier: barrier.clone(),
            })
            .collect()
    }
}

/// One rank's endpoint of a [`Grid`].
pub struct GridComm {
    rank: Rank,
    world: u32,
    senders: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    barrier: Arc<Barrier>,
}

impl Comm for GridComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world(&self) -> u32 {
        self.world
    }

    fn send(&self, dst: Rank, tag: Tag, payload: Bytes) -> Result<(), Error> {
        let envelope = Envelope {
            src: self.rank,
            tag,
            payload,
        };
        self.senders[dst as usize]
            .send(envelope)
            .map_err(|_| Error::Disconnected(dst))
    }

    fn try_recv(&mut self) -> Option<Envelope> {
        match self.inbox.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn recv(&mut self) -> Result<Envelope, Error> {
        self.inbox.recv().map_err(|_| Error::Closed)
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn per_source_fifo_order() {
        let mut grid = Grid::new(2);
        let mut b = grid.pop().unwrap();
        let a = grid.pop().unwrap();

        for i in 0..100u8 {
            a.send(1, Tag::Rpc, Bytes::copy_from_slice(&[i])).unwrap();
        }
        for i in 0..100u8 {
            let envelope = b.recv().unwrap();
            assert_eq!(envelope.src, 0);
            assert_eq!(envelope.payload.as_ref(), &[i]);
        }
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn barrier_synchronizes_all_ranks() {
        let comms = Grid::new(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    comm.barrier();
                    comm.barrier();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
