//! Peer-side clients for the three master channels.
//!
//! The worker is built from these, and they can be used directly to talk to
//! a master without running a full worker (tests, monitoring tools).

use crate::error::Result;
use crate::protocol::{
    Announcement, ResultChannelFrame, Task, TaskChannelFrame, TaskId, TaskResult, WorkerId,
};
use std::time::Duration;
use tracing::debug;
use weft_common::codec::{self, read_message, write_message};
use weft_common::net::connect_with_retry;
use weft_common::{Endpoint, FrameReader, FrameWriter};

/// Pulls tasks from a master's task channel.
///
/// The master only sends as many tasks as this peer has granted credits,
/// starting with the `slots` announced at connect time.
pub struct TaskReceiver {
    inbox: TaskInbox,
    credits: CreditSender,
}

impl TaskReceiver {
    /// Connect and introduce ourselves with `slots` initial credits.
    pub async fn connect(
        endpoint: &Endpoint,
        worker_id: &WorkerId,
        slots: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let connection = connect_with_retry(endpoint, timeout).await?;
        let (reader, mut writer) = codec::split(connection);
        write_message(
            &mut writer,
            &TaskChannelFrame::Hello {
                worker_id: worker_id.clone(),
                slots,
            },
        )
        .await?;
        debug!("Connected to task channel {} as {}", endpoint, worker_id);
        Ok(Self {
            inbox: TaskInbox { reader },
            credits: CreditSender { writer },
        })
    }

    /// Next task, or `None` once the master closed the channel.
    pub async fn recv(&mut self) -> Result<Option<Task>> {
        self.inbox.recv().await
    }

    pub async fn grant(&mut self, slots: u32) -> Result<()> {
        self.credits.grant(slots).await
    }

    /// Separate the receiving and credit-granting halves.
    pub fn into_split(self) -> (TaskInbox, CreditSender) {
        (self.inbox, self.credits)
    }
}

/// Receiving half of a [`TaskReceiver`].
pub struct TaskInbox {
    reader: FrameReader,
}

impl TaskInbox {
    /// Cancel-safe: dropping the future never loses a buffered frame.
    pub async fn recv(&mut self) -> Result<Option<Task>> {
        Ok(read_message(&mut self.reader).await?)
    }
}

/// Credit-granting half of a [`TaskReceiver`].
pub struct CreditSender {
    writer: FrameWriter,
}

impl CreditSender {
    pub async fn grant(&mut self, slots: u32) -> Result<()> {
        Ok(write_message(&mut self.writer, &TaskChannelFrame::Credit { slots }).await?)
    }
}

/// Pushes results and heartbeats to a master's result channel.
pub struct ResultSender {
    writer: FrameWriter,
    // Held so the master does not see the connection half-closed.
    _reader: FrameReader,
}

impl ResultSender {
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let connection = connect_with_retry(endpoint, timeout).await?;
        let (reader, writer) = codec::split(connection);
        debug!("Connected to result channel {}", endpoint);
        Ok(Self {
            writer,
            _reader: reader,
        })
    }

    pub async fn send_result(&mut self, result: TaskResult) -> Result<()> {
        self.send(&ResultChannelFrame::Result(result)).await
    }

    pub async fn heartbeat(&mut self, worker_id: &WorkerId, outstanding: Vec<TaskId>) -> Result<()> {
        self.send(&ResultChannelFrame::Heartbeat {
            worker_id: worker_id.clone(),
            outstanding,
        })
        .await
    }

    pub async fn send(&mut self, frame: &ResultChannelFrame) -> Result<()> {
        Ok(write_message(&mut self.writer, frame).await?)
    }
}

/// Subscribes to a master's announcement channel.
pub struct AnnouncementSubscriber {
    reader: FrameReader,
    _writer: FrameWriter,
}

impl AnnouncementSubscriber {
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let connection = connect_with_retry(endpoint, timeout).await?;
        let (reader, writer) = codec::split(connection);
        debug!("Subscribed to announcements on {}", endpoint);
        Ok(Self {
            reader,
            _writer: writer,
        })
    }

    /// Next announcement, or `None` once the master went away.
    pub async fn recv(&mut self) -> Result<Option<Announcement>> {
        Ok(read_message(&mut self.reader).await?)
    }
}
