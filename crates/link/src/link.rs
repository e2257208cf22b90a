//! The per-direction state machine driving assembly and submission.

use btp_types::{BmcLinkStatus, BtpAddress, Preference, RelayCode, RelayError, RelayResult, Result, Sender};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    assembler::ItemBuffer,
    message::{BlockUpdate, ItemKind, RelayMessage, RelayMessageItem},
    receiver::{ReceiveStatus, Receiver},
};

/// Capacity of the finalized-status back-channel to the receiver.
const FINALIZED_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Running,
    Pending,
}

/// One relay direction: owns the observation stream, the pending-message
/// ledger, and the running/pending state machine.
///
/// The ledger and the link status are touched only from [`Link::run`]'s
/// select loop, which is what gives the ordering guarantees: observations
/// are consumed in emission order, messages are submitted in build order,
/// and results are matched by id.
pub struct Link {
    src: BtpAddress,
    receiver: Box<dyn Receiver>,
    sender: Box<dyn Sender>,
    bls: BmcLinkStatus,
    rss: Vec<ReceiveStatus>,
    rms: Vec<RelayMessage>,
    buf: ItemBuffer,
    state: RelayState,
    pref: Preference,
    limit: i64,
    finalized_tx: Option<mpsc::Sender<BmcLinkStatus>>,
}

impl Link {
    pub fn new(src: BtpAddress, receiver: Box<dyn Receiver>, sender: Box<dyn Sender>) -> Self {
        Self {
            src,
            receiver,
            sender,
            bls: BmcLinkStatus::default(),
            rss: Vec::new(),
            rms: Vec::new(),
            buf: ItemBuffer::new(),
            state: RelayState::Running,
            pref: Preference::default(),
            limit: 0,
            finalized_tx: None,
        }
    }

    /// Runs the link until an adapter stream closes (clean stop) or a
    /// terminal error surfaces.
    pub async fn run(mut self) -> Result<()> {
        self.pref = self.sender.preference();
        self.limit = self.pref.tx_size_limit - self.pref.margin_for_limit;

        let mut results = self.sender.start().await?;
        self.bls = self.sender.get_status().await?;
        debug!(
            src = %self.src,
            height = self.bls.verifier.height,
            rx_seq = self.bls.rx_seq,
            "link starting from destination status"
        );

        let mut statuses = self.receiver.start(&self.bls).await?;
        let (fin_tx, fin_rx) = mpsc::channel(FINALIZED_CHANNEL_CAPACITY);
        self.finalized_tx = Some(fin_tx);
        self.receiver.finalized_status(fin_rx);

        let mut started = false;
        loop {
            tokio::select! {
                event = statuses.recv() => match event {
                    Some(Ok(rs)) => self.on_receive_status(rs, &mut started).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                result = results.recv() => match result {
                    Some(rr) => self.on_result(rr).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn on_receive_status(&mut self, rs: ReceiveStatus, started: &mut bool) -> Result<()> {
        debug!(height = rs.height, seq = rs.seq, "receive status");
        self.rss.push(rs);

        if !*started {
            *started = true;
            self.handle_undelivered().await?;
            self.handle_relay_message().await?;
            self.state = RelayState::Pending;
        }

        if self.bls.verifier.height < rs.height {
            self.handle_relay_message().await?;
        }
        Ok(())
    }

    async fn on_result(&mut self, rr: RelayResult) -> Result<()> {
        if !self.rms.iter().any(|rm| rm.id == rr.id) {
            return Ok(());
        }
        match rr.code {
            RelayCode::Success => {
                if self.pref.latest_result || rr.finalized {
                    self.success_relay_message(&rr.id).await?;
                }
            }
            RelayCode::BmvNotVerifiable => {
                // Usually "sent too soon": once the revert finalizes, the
                // whole ledger is built on evidence the verifier rejected.
                if !rr.finalized {
                    self.state = RelayState::Pending;
                } else {
                    self.bls = self.sender.get_status().await?;
                    self.rms.clear();
                    self.state = RelayState::Running;
                    self.handle_relay_message().await?;
                }
            }
            RelayCode::BmvAlreadyVerified => {
                // A peer relay advanced the destination past this message.
                if !rr.finalized {
                    self.state = RelayState::Pending;
                } else {
                    self.bls = self.sender.get_status().await?;
                    self.state = RelayState::Running;
                    let bls = self.bls.clone();
                    if self.remove_relay_messages_through(&bls) == Some(0) {
                        self.rms.clear();
                    }
                    self.handle_relay_message().await?;
                }
            }
            RelayCode::BmvRevertInvalidBlockWitnessOld => {
                self.update_block_proof(&rr.id).await?;
            }
            RelayCode::InvalidState => self.state = RelayState::Pending,
            code => return Err(RelayError::FatalResult { id: rr.id, code }),
        }
        Ok(())
    }

    /// One assembly-and-send pass, gated on the running state.
    async fn handle_relay_message(&mut self) -> Result<()> {
        if self.state != RelayState::Running {
            return Ok(());
        }
        self.send_relay_messages().await?;
        loop {
            let latest = self.rss.last().copied();
            match latest {
                Some(rs) if self.state == RelayState::Running && self.bls.verifier.height < rs.height => {
                    self.build_relay_message().await?;
                    self.send_relay_messages().await?;
                }
                _ => {
                    debug!(
                        state = ?self.state,
                        backlog = self.rss.len(),
                        "assembly pass done"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Walks the ledger in insertion order, submitting unsent messages.
    /// A full sender queue flips the link to pending without raising.
    async fn send_relay_messages(&mut self) -> Result<()> {
        for i in 0..self.rms.len() {
            if self.rms[i].sending_status {
                continue;
            }
            let (id, message) = (self.rms[i].id.clone(), self.rms[i].message.clone());
            debug!(
                %id,
                height = self.rms[i].bls.verifier.height,
                rx_seq = self.rms[i].bls.rx_seq,
                size = message.len(),
                "sending relay message"
            );
            match self.sender.relay(&id, &message).await {
                Ok(()) => self.rms[i].sending_status = true,
                Err(e) if e.is_invalid_state() => {
                    self.state = RelayState::Pending;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Assembles block updates and their proofs into the buffer, flushing
    /// complete relay messages onto the ledger.
    async fn build_relay_message(&mut self) -> Result<()> {
        debug!(
            height = self.bls.verifier.height,
            rx_seq = self.bls.rx_seq,
            "building relay message"
        );
        let bus = self.build_block_updates().await?;
        for bu in bus {
            let item = RelayMessageItem::BlockUpdate(bu.clone());
            item.update_link_status(&mut self.bls);
            self.buf.push(item);

            let mp_len = self.build_proofs(Some(&bu)).await?;
            if mp_len == 0 {
                if self.pref.filled_block_update {
                    if self.buf.size() > self.pref.tx_size_limit {
                        self.flush()?;
                    }
                } else {
                    self.flush()?;
                }
            } else {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Asks the receiver for updates sized to the remaining budget. When
    /// nothing fits, the open buffer is flushed to free the whole budget;
    /// an update that exceeds even the full budget is a design bug.
    async fn build_block_updates(&mut self) -> Result<Vec<BlockUpdate>> {
        loop {
            let budget = self.limit - self.buf.size();
            let bus = self.receiver.build_block_update(&self.bls, budget).await?;
            if !bus.is_empty() {
                return Ok(bus);
            }
            if !self.buf.is_empty() {
                self.flush()?;
                continue;
            }
            return Err(RelayError::IllegalArgument(format!(
                "block update exceeds the transaction size budget {}",
                self.limit
            )));
        }
    }

    /// Builds message proofs covering `(bls.rx_seq, rs.seq]` for the block
    /// the verifier currently points at. Returns the total proof bytes.
    async fn build_proofs(&mut self, bu: Option<&BlockUpdate>) -> Result<i64> {
        let Some(rs) = self.receive_status_at(self.bls.verifier.height) else {
            return Ok(0);
        };
        let mut mp_len = 0;
        while rs.seq > self.bls.rx_seq {
            let budget = self.limit - self.buf.size();
            let Some(mp) = self.receiver.build_message_proof(&self.bls, budget).await? else {
                break;
            };
            let item = RelayMessageItem::MessageProof(mp);
            if item.len() == 0 {
                break;
            }
            mp_len += item.len();

            // A proof needs a block anchor when it lands in a fresh buffer
            // or when the update carrying it has no proof slot.
            let needs_anchor = if self.buf.size() + item.len() > self.pref.tx_size_limit {
                self.flush()?;
                true
            } else {
                bu.is_none_or(|b| b.proof_height() == -1)
            };
            if needs_anchor {
                let height = self.receiver.height_for_seq(self.bls.rx_seq + 1);
                if let Some(bp) = self.receiver.build_block_proof(&self.bls, height).await? {
                    self.buf.push(RelayMessageItem::BlockProof(bp));
                }
            }
            item.update_link_status(&mut self.bls);
            self.buf.push(item);
        }
        Ok(mp_len)
    }

    /// Undelivered-message recovery: the destination verified the block
    /// but has not received all its messages, so deliver proofs only.
    async fn handle_undelivered(&mut self) -> Result<()> {
        let Some(rs) = self.receive_status_at(self.bls.verifier.height) else {
            return Ok(());
        };
        while self.bls.rx_seq < rs.seq {
            debug!(
                height = rs.height,
                seq = rs.seq,
                rx_seq = self.bls.rx_seq,
                "recovering undelivered messages"
            );
            let before = self.bls.rx_seq;
            self.build_proofs(None).await?;
            if self.bls.rx_seq == before {
                break;
            }
        }
        if !self.buf.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    /// Seals the buffer into a relay message recording the post-application
    /// status, and queues it on the ledger.
    fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let items = self.buf.take();
        let message = self.receiver.build_relay_message(&items)?;
        let rm = RelayMessage {
            id: RelayMessage::id_for(self.src.network_id(), &self.bls),
            bls: self.bls.clone(),
            message,
            items,
            sending_status: false,
        };
        debug!(
            id = %rm.id,
            height = rm.bls.verifier.height,
            tx_seq = rm.bls.tx_seq,
            rx_seq = rm.bls.rx_seq,
            "queued relay message"
        );
        self.rms.push(rm);
        Ok(())
    }

    async fn success_relay_message(&mut self, id: &str) -> Result<()> {
        let Some(pos) = self.rms.iter().position(|rm| rm.id == id) else {
            return Ok(());
        };
        let bls = self.rms[pos].bls.clone();
        self.rms.drain(..=pos);
        self.remove_receive_status(&bls);
        self.state = RelayState::Running;
        self.handle_relay_message().await?;
        if let Some(tx) = &self.finalized_tx {
            let _ = tx.send(bls).await;
        }
        Ok(())
    }

    /// Rebuilds the stale block proof inside the failing message and marks
    /// it for resubmission.
    async fn update_block_proof(&mut self, id: &str) -> Result<()> {
        let Some(pos) = self.rms.iter().position(|rm| rm.id == id) else {
            return Ok(());
        };
        let rm_bls = self.rms[pos].bls.clone();
        let height = self.receiver.height_for_seq(rm_bls.rx_seq);
        let Some(bp) = self.receiver.build_block_proof(&rm_bls, height).await? else {
            return Ok(());
        };
        let rm = &mut self.rms[pos];
        for item in &mut rm.items {
            if item.kind() == ItemKind::BlockProof {
                *item = RelayMessageItem::BlockProof(bp.clone());
            }
        }
        rm.message = self.receiver.build_relay_message(&rm.items)?;
        rm.sending_status = false;
        Ok(())
    }

    fn receive_status_at(&self, height: i64) -> Option<ReceiveStatus> {
        self.rss.iter().find(|rs| rs.height == height).copied()
    }

    fn remove_receive_status(&mut self, bls: &BmcLinkStatus) {
        self.rss
            .retain(|rs| rs.height > bls.verifier.height || rs.seq > bls.rx_seq);
    }

    /// Drops the ledger prefix covered by `bls`, returning the cut index.
    fn remove_relay_messages_through(&mut self, bls: &BmcLinkStatus) -> Option<usize> {
        let idx = self.rms.iter().position(|rm| {
            rm.bls.verifier.height <= bls.verifier.height && rm.bls.rx_seq <= bls.rx_seq
        })?;
        self.rms.drain(..=idx);
        Some(idx)
    }
}
