// Segment Queue: Keeps at most one media segment request and one initialization
// segment request in flight for a track, consistent with the latest wanted queue.
//
// The queue runs as a spawned actor reacting to:
// - changes of the wanted queue and of the "can stream" gate,
// - progress messages of its own requests,
// - its stop token.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{QueuedSegment, SegmentQueueContent, SegmentQueueEvent, SegmentQueueItem};
use crate::config::SegmentQueueConfig;
use crate::error::DownloadError;
use crate::fetcher::{FetchCallbacks, PrioritizedSegmentFetcher, SegmentChunk, SegmentRequest};
use crate::model::{ParsedChunk, SegmentContext, SegmentDescriptor};
use crate::prioritizer::TaskId;
use crate::shared::SharedReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Init,
    Media,
}

enum RequestMessage {
    Chunk(SegmentChunk),
    AllChunksReceived,
    Retry(DownloadError),
    Interrupted,
    Settled(Result<(), DownloadError>),
}

struct TaggedMessage {
    request_id: u64,
    kind: RequestKind,
    message: RequestMessage,
}

/// Forwards the progress of one request to the queue actor.
struct RequestCallbacks {
    request_id: u64,
    kind: RequestKind,
    tx: mpsc::UnboundedSender<TaggedMessage>,
}

impl RequestCallbacks {
    fn send(&self, message: RequestMessage) {
        let _ = self.tx.send(TaggedMessage {
            request_id: self.request_id,
            kind: self.kind,
            message,
        });
    }
}

impl FetchCallbacks for RequestCallbacks {
    fn on_chunk(&self, chunk: SegmentChunk) {
        self.send(RequestMessage::Chunk(chunk));
    }

    fn on_all_chunks_received(&self) {
        self.send(RequestMessage::AllChunksReceived);
    }

    fn on_retry(&self, error: &DownloadError) {
        self.send(RequestMessage::Retry(error.clone()));
    }

    fn before_interrupted(&self) {
        self.send(RequestMessage::Interrupted);
    }
}

struct PendingRequest {
    request_id: u64,
    task_id: TaskId,
    segment: Arc<SegmentDescriptor>,
    priority: u32,
    token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitTimescale {
    /// The initialization segment has not been parsed yet.
    Unknown,
    Known(Option<u32>),
}

/// Work waiting for the initialization segment to be parsed.
enum Deferred {
    Chunk {
        request_id: u64,
        segment: Arc<SegmentDescriptor>,
        chunk: SegmentChunk,
    },
    FullyLoaded {
        segment: Arc<SegmentDescriptor>,
    },
    ContinueAfter {
        segment: Arc<SegmentDescriptor>,
    },
}

#[derive(Default)]
struct QueueStatus {
    media: Option<(TaskId, Arc<SegmentDescriptor>)>,
    init: Option<(TaskId, Arc<SegmentDescriptor>)>,
    stopped: bool,
}

/// Control handle of a running segment queue.
#[derive(Clone)]
pub struct SegmentQueueHandle {
    token: CancellationToken,
    status: Arc<Mutex<QueueStatus>>,
    fetcher: PrioritizedSegmentFetcher,
}

impl SegmentQueueHandle {
    /// Media segment currently being requested.
    pub fn requested_media_segment(&self) -> Option<Arc<SegmentDescriptor>> {
        self.status.lock().media.as_ref().map(|(_, segment)| Arc::clone(segment))
    }

    /// Initialization segment currently being requested.
    pub fn requested_init_segment(&self) -> Option<Arc<SegmentDescriptor>> {
        self.status.lock().init.as_ref().map(|(_, segment)| Arc::clone(segment))
    }

    /// Cancels every request of the track. Calling it again, or on an idle queue, is a
    /// no-op.
    pub fn stop(&self) {
        let requests = {
            let mut status = self.status.lock();
            if status.stopped {
                return;
            }
            status.stopped = true;
            [status.media.take(), status.init.take()]
        };
        self.token.cancel();
        for (task_id, _) in requests.into_iter().flatten() {
            self.fetcher.cancel(task_id);
        }
        info!("Segment queue stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.status.lock().stopped
    }
}

/// Creates the per-track queue actors.
pub struct SegmentQueue {
    fetcher: PrioritizedSegmentFetcher,
    config: SegmentQueueConfig,
}

impl SegmentQueue {
    pub fn new(fetcher: PrioritizedSegmentFetcher, config: SegmentQueueConfig) -> Self {
        Self { fetcher, config }
    }

    /// Starts loading segments of `content` according to `wanted`.
    ///
    /// Media segments are only requested while `can_stream` is `true`. Events are
    /// delivered on the returned receiver; dropping it stops the queue. Cancelling
    /// `token` stops the queue as [`SegmentQueueHandle::stop`] does.
    pub fn start(
        &self,
        content: SegmentQueueContent,
        wanted: SharedReference<SegmentQueueItem>,
        can_stream: SharedReference<bool>,
        token: CancellationToken,
    ) -> (SegmentQueueHandle, mpsc::Receiver<SegmentQueueEvent>) {
        let token = token.child_token();
        let status = Arc::new(Mutex::new(QueueStatus::default()));
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        let init_timescale = if content.has_init_segment {
            InitTimescale::Unknown
        } else {
            InitTimescale::Known(None)
        };

        let actor = QueueActor {
            content,
            fetcher: self.fetcher.clone(),
            wanted,
            can_stream,
            token: token.clone(),
            status: Arc::clone(&status),
            messages_tx,
            next_request_id: 0,
            media_request: None,
            init_request: None,
            init_timescale,
            deferred: Vec::new(),
            media_awaiting_init: None,
            outbox: Vec::new(),
            stopped: false,
        };
        tokio::spawn(actor.run(messages_rx, events_tx));

        let handle = SegmentQueueHandle {
            token,
            status,
            fetcher: self.fetcher.clone(),
        };
        (handle, events_rx)
    }
}

struct QueueActor {
    content: SegmentQueueContent,
    fetcher: PrioritizedSegmentFetcher,
    wanted: SharedReference<SegmentQueueItem>,
    can_stream: SharedReference<bool>,
    token: CancellationToken,
    status: Arc<Mutex<QueueStatus>>,
    messages_tx: mpsc::UnboundedSender<TaggedMessage>,
    next_request_id: u64,
    media_request: Option<PendingRequest>,
    init_request: Option<PendingRequest>,
    init_timescale: InitTimescale,
    deferred: Vec<Deferred>,
    /// Media segment already loaded whose follow-up waits for the init segment.
    media_awaiting_init: Option<Arc<SegmentDescriptor>>,
    outbox: Vec<SegmentQueueEvent>,
    stopped: bool,
}

impl QueueActor {
    async fn run(
        mut self,
        mut messages_rx: mpsc::UnboundedReceiver<TaggedMessage>,
        events: mpsc::Sender<SegmentQueueEvent>,
    ) {
        info!(
            track = %self.content.buffer_type,
            representation = %self.content.representation.id,
            has_init_segment = self.content.has_init_segment,
            "Segment queue started"
        );
        let mut wanted_rx = self.wanted.subscribe();
        let mut can_stream_rx = self.can_stream.subscribe();
        let mut wanted_open = true;
        let mut can_stream_open = true;

        self.check_status();

        loop {
            if !self.flush(&events).await || self.stopped {
                break;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,

                Some(message) = messages_rx.recv() => self.handle_message(message),

                changed = wanted_rx.changed(), if wanted_open => {
                    if changed.is_err() {
                        wanted_open = false;
                    } else {
                        self.check_status();
                    }
                }

                changed = can_stream_rx.changed(), if can_stream_open => {
                    if changed.is_err() {
                        can_stream_open = false;
                    } else {
                        let can_stream = *can_stream_rx.borrow_and_update();
                        debug!(can_stream, "Streaming gate changed");
                        self.check_status();
                    }
                }
            }
        }

        self.shutdown();
        debug!(track = %self.content.buffer_type, "Segment queue actor exited");
    }

    /// Delivers pending events. Returns `false` once the consumer is gone.
    async fn flush(&mut self, events: &mpsc::Sender<SegmentQueueEvent>) -> bool {
        for event in std::mem::take(&mut self.outbox) {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return false,
                sent = events.send(event) => {
                    if sent.is_err() {
                        debug!("Segment queue event receiver dropped");
                        return false;
                    }
                }
            }
        }
        true
    }

    fn slot(&mut self, kind: RequestKind) -> &mut Option<PendingRequest> {
        match kind {
            RequestKind::Init => &mut self.init_request,
            RequestKind::Media => &mut self.media_request,
        }
    }

    fn slot_ref(&self, kind: RequestKind) -> Option<&PendingRequest> {
        match kind {
            RequestKind::Init => self.init_request.as_ref(),
            RequestKind::Media => self.media_request.as_ref(),
        }
    }

    fn update_status(&self) {
        let describe = |request: &PendingRequest| (request.task_id, Arc::clone(&request.segment));
        let mut status = self.status.lock();
        status.media = self.media_request.as_ref().map(describe);
        status.init = self.init_request.as_ref().map(describe);
    }

    fn check_status(&mut self) {
        if self.stopped {
            return;
        }
        let wanted = self.wanted.get();
        self.check_init_segment(wanted.init_segment.as_ref());
        self.check_media_segments(wanted.segment_queue.first());
    }

    fn check_init_segment(&mut self, wanted: Option<&QueuedSegment>) {
        let current = self
            .init_request
            .as_ref()
            .map(|request| (Arc::clone(&request.segment), request.priority, request.task_id));

        match (wanted, current) {
            (None, None) => {}
            (None, Some(_)) => {
                debug!("Initialization segment no longer wanted, cancelling its request");
                self.cancel_request(RequestKind::Init);
            }
            (Some(wanted), Some((segment, priority, task_id))) if segment.id == wanted.segment.id => {
                if priority != wanted.priority {
                    self.update_priority(RequestKind::Init, task_id, wanted.priority);
                }
            }
            (Some(wanted), Some(_)) => {
                debug!(segment = %wanted.segment.id, "Wanted initialization segment changed");
                self.cancel_request(RequestKind::Init);
                self.start_request(RequestKind::Init, wanted);
            }
            (Some(wanted), None) => self.start_request(RequestKind::Init, wanted),
        }
    }

    fn check_media_segments(&mut self, next: Option<&QueuedSegment>) {
        let current = self
            .media_request
            .as_ref()
            .map(|request| (Arc::clone(&request.segment), request.priority, request.task_id));

        match (next, current) {
            (None, None) => {}
            (None, Some(_)) => {
                debug!("No more media segment wanted, cancelling current request");
                self.cancel_request(RequestKind::Media);
                self.outbox.push(SegmentQueueEvent::EmptyQueue);
            }
            (Some(next), Some((segment, priority, task_id))) if segment.id == next.segment.id => {
                if priority != next.priority {
                    self.update_priority(RequestKind::Media, task_id, next.priority);
                }
            }
            (Some(next), Some(_)) => {
                debug!(segment = %next.segment.id, "Wanted media segment changed, restarting request");
                self.cancel_request(RequestKind::Media);
                self.start_media_request(next);
            }
            (Some(next), None)
                if self
                    .media_awaiting_init
                    .as_ref()
                    .is_some_and(|loaded| loaded.id == next.segment.id) =>
            {
                trace!(segment = %next.segment.id, "Media segment already loaded, waiting for initialization segment");
            }
            (Some(next), None) => self.start_media_request(next),
        }
    }

    fn update_priority(&mut self, kind: RequestKind, task_id: TaskId, priority: u32) {
        debug!(?kind, priority, "Updating segment request priority");
        self.fetcher.update_priority(task_id, priority);
        if let Some(request) = self.slot(kind).as_mut() {
            request.priority = priority;
        }
    }

    fn start_media_request(&mut self, next: &QueuedSegment) {
        if !self.can_stream.get() {
            debug!(segment = %next.segment.id, "Streaming not allowed for now, postponing request");
            return;
        }
        self.deferred
            .retain(|deferred| !matches!(deferred, Deferred::ContinueAfter { .. }));
        self.media_awaiting_init = None;
        self.start_request(RequestKind::Media, next);
    }

    fn start_request(&mut self, kind: RequestKind, queued: &QueuedSegment) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let token = self.token.child_token();
        let context = SegmentContext::new(
            self.content.buffer_type,
            Arc::clone(&self.content.representation),
            Arc::clone(&queued.segment),
        );
        debug!(
            segment = %context.label(),
            priority = queued.priority,
            ?kind,
            "Requesting segment"
        );

        let callbacks = Arc::new(RequestCallbacks {
            request_id,
            kind,
            tx: self.messages_tx.clone(),
        });
        let SegmentRequest { id, future } =
            self.fetcher
                .create_request(context, queued.priority, callbacks, token.clone());

        let tx = self.messages_tx.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send(TaggedMessage {
                request_id,
                kind,
                message: RequestMessage::Settled(result),
            });
        });

        *self.slot(kind) = Some(PendingRequest {
            request_id,
            task_id: id,
            segment: Arc::clone(&queued.segment),
            priority: queued.priority,
            token,
        });
        self.update_status();
    }

    /// Cancels the request of `kind`, removing it from the prioritizer before anything
    /// else can be started.
    fn cancel_request(&mut self, kind: RequestKind) {
        let Some(request) = self.slot(kind).take() else {
            return;
        };
        request.token.cancel();
        self.fetcher.cancel(request.task_id);
        self.deferred.retain(|deferred| {
            !matches!(deferred, Deferred::Chunk { request_id, .. } if *request_id == request.request_id)
        });
        self.update_status();
    }

    fn handle_message(&mut self, message: TaggedMessage) {
        let TaggedMessage {
            request_id,
            kind,
            message,
        } = message;

        let Some(segment) = self
            .slot_ref(kind)
            .filter(|request| request.request_id == request_id)
            .map(|request| Arc::clone(&request.segment))
        else {
            trace!(request_id, ?kind, "Ignoring message of a finished request");
            return;
        };

        match message {
            RequestMessage::Chunk(chunk) => match kind {
                RequestKind::Init => self.on_init_chunk(segment, &chunk),
                RequestKind::Media => self.on_media_chunk(request_id, segment, chunk),
            },
            RequestMessage::AllChunksReceived => {
                if kind == RequestKind::Media && self.init_timescale == InitTimescale::Unknown {
                    self.deferred.push(Deferred::FullyLoaded { segment });
                } else {
                    self.outbox
                        .push(SegmentQueueEvent::FullyLoadedSegment { segment });
                }
            }
            RequestMessage::Retry(error) => {
                warn!(segment = %segment.id, error = %error, "Segment request failed, retrying");
                self.outbox
                    .push(SegmentQueueEvent::RequestRetry { segment, error });
            }
            RequestMessage::Interrupted => {
                info!(segment = %segment.id, ?kind, "Segment request interrupted");
                self.deferred.retain(|deferred| {
                    !matches!(deferred, Deferred::Chunk { request_id: id, .. } if *id == request_id)
                });
            }
            RequestMessage::Settled(Ok(())) => {
                *self.slot(kind) = None;
                self.update_status();
                if kind == RequestKind::Media {
                    if self.init_timescale == InitTimescale::Unknown {
                        self.media_awaiting_init = Some(Arc::clone(&segment));
                        self.deferred.push(Deferred::ContinueAfter { segment });
                    } else {
                        self.continue_after(&segment);
                    }
                }
            }
            RequestMessage::Settled(Err(error)) if error.is_cancelled() => {
                *self.slot(kind) = None;
                self.update_status();
            }
            RequestMessage::Settled(Err(error)) => self.fail(error),
        }
    }

    fn on_init_chunk(&mut self, segment: Arc<SegmentDescriptor>, chunk: &SegmentChunk) {
        match chunk.parse(None) {
            Ok(ParsedChunk::Init(parsed)) => {
                debug!(
                    segment = %segment.id,
                    timescale = ?parsed.init_timescale,
                    "Initialization segment parsed"
                );
                self.init_timescale = InitTimescale::Known(parsed.init_timescale);
                self.outbox.push(SegmentQueueEvent::ParsedInitSegment {
                    segment,
                    chunk: parsed,
                });
                self.flush_deferred();
            }
            Ok(ParsedChunk::Media(_)) => self.fail(DownloadError::UnexpectedChunk {
                reason: format!("media data parsed from initialization segment {}", segment.id),
            }),
            Err(error) => self.fail(error),
        }
    }

    fn on_media_chunk(&mut self, request_id: u64, segment: Arc<SegmentDescriptor>, chunk: SegmentChunk) {
        match self.init_timescale {
            InitTimescale::Known(timescale) => self.parse_media_chunk(segment, &chunk, timescale),
            InitTimescale::Unknown => {
                trace!(segment = %segment.id, "Deferring media chunk until the initialization segment is parsed");
                self.deferred.push(Deferred::Chunk {
                    request_id,
                    segment,
                    chunk,
                });
            }
        }
    }

    fn parse_media_chunk(
        &mut self,
        segment: Arc<SegmentDescriptor>,
        chunk: &SegmentChunk,
        timescale: Option<u32>,
    ) {
        match chunk.parse(timescale) {
            Ok(ParsedChunk::Media(parsed)) => {
                self.outbox.push(SegmentQueueEvent::ParsedMediaSegment {
                    segment,
                    chunk: parsed,
                });
            }
            Ok(ParsedChunk::Init(_)) => self.fail(DownloadError::UnexpectedChunk {
                reason: format!("initialization data parsed from media segment {}", segment.id),
            }),
            Err(error) => self.fail(error),
        }
    }

    fn flush_deferred(&mut self) {
        let InitTimescale::Known(timescale) = self.init_timescale else {
            return;
        };
        for deferred in std::mem::take(&mut self.deferred) {
            if self.stopped {
                break;
            }
            match deferred {
                Deferred::Chunk { segment, chunk, .. } => {
                    self.parse_media_chunk(segment, &chunk, timescale)
                }
                Deferred::FullyLoaded { segment } => self
                    .outbox
                    .push(SegmentQueueEvent::FullyLoadedSegment { segment }),
                Deferred::ContinueAfter { segment } => self.continue_after(&segment),
            }
        }
    }

    /// Moves on to the next wanted media segment once `finished` is loaded.
    fn continue_after(&mut self, finished: &Arc<SegmentDescriptor>) {
        self.media_awaiting_init = None;
        if self.stopped || self.media_request.is_some() {
            return;
        }

        self.wanted.update_silently(|item| {
            if item
                .segment_queue
                .first()
                .is_some_and(|queued| queued.segment.id == finished.id)
            {
                item.segment_queue.remove(0);
            }
        });

        match self.wanted.with(|item| item.segment_queue.first().cloned()) {
            None => {
                debug!("Media segment queue is empty");
                self.outbox.push(SegmentQueueEvent::EmptyQueue);
            }
            Some(next) => self.start_media_request(&next),
        }
    }

    fn fail(&mut self, error: DownloadError) {
        error!(
            track = %self.content.buffer_type,
            error = %error,
            "Fatal segment queue error, stopping"
        );
        self.outbox.push(SegmentQueueEvent::Error(error));
        self.cancel_request(RequestKind::Media);
        self.cancel_request(RequestKind::Init);
        self.deferred.clear();
        self.media_awaiting_init = None;
        self.stopped = true;
        self.status.lock().stopped = true;
    }

    fn shutdown(&mut self) {
        self.cancel_request(RequestKind::Media);
        self.cancel_request(RequestKind::Init);
        self.deferred.clear();
        self.media_awaiting_init = None;
        self.outbox.clear();
        self.stopped = true;
        self.token.cancel();
        let mut status = self.status.lock();
        status.stopped = true;
        status.media = None;
        status.init = None;
    }
}
