//! Per-language TTS text buffer.
//!
//! Streamed answer fragments accumulate until the buffer holds at least
//! `min_words` words or the oldest pending text has waited `max_wait`, then a
//! word-aligned prefix is cut and handed to a single worker task for
//! synthesis. One worker per buffer consumes cuts in FIFO order, so audio is
//! delivered in extraction order even when the vendor is slow. A synthesis
//! failure drops that prefix only; the buffer keeps going.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::org::TtsModel;
use crate::phoneme::PhonemeTable;
use crate::tts::client::{SpeechRenderer, SynthesizedAudio};

pub const MIN_WORDS: usize = 3;
pub const MAX_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct TtsBufferConfig {
    pub min_words: usize,
    pub max_wait: Duration,
}

impl Default for TtsBufferConfig {
    fn default() -> Self {
        Self {
            min_words: MIN_WORDS,
            max_wait: MAX_WAIT,
        }
    }
}

/// A synthesized prefix ready for the event stream.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub text: String,
    pub language: String,
    pub audio: SynthesizedAudio,
    pub chunk_index: u64,
    pub is_final: bool,
}

/// Downstream seam for finished (or failed) synthesis work.
#[async_trait]
pub trait AudioDelivery: Send + Sync {
    async fn audio_ready(&self, chunk: AudioChunk);
    async fn synthesis_failed(&self, language: &str, error: &CoreError);
}

struct WorkItem {
    text: String,
    index: u64,
    is_final: bool,
}

struct BufferState {
    pending: String,
    first_arrival: Option<Instant>,
    // Bumped whenever the armed timer becomes irrelevant; a firing timer
    // compares its captured epoch and stands down on mismatch.
    timer_epoch: u64,
    closed: bool,
    in_flight: usize,
    next_index: u64,
}

struct Shared {
    config: TtsBufferConfig,
    language: String,
    model: Arc<TtsModel>,
    table: Arc<PhonemeTable>,
    renderer: Arc<dyn SpeechRenderer>,
    delivery: Arc<dyn AudioDelivery>,
    state: Mutex<BufferState>,
    // Lives here (not on TtsBuffer) so timer tasks never hold a sender
    // clone: once `close` takes it, the worker's channel drains and shuts.
    work_tx: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
}

impl Shared {
    /// Try to enqueue an item. Returns false when the queue is gone; the
    /// caller owns the in-flight rollback (it may already hold the state
    /// lock).
    fn try_enqueue(&self, item: WorkItem) -> bool {
        self.work_tx
            .lock()
            .as_ref()
            .map_or(false, |tx| tx.send(item).is_ok())
    }

    /// Enqueue from a context that does NOT hold the state lock.
    fn enqueue(&self, item: WorkItem) {
        if !self.try_enqueue(item) {
            self.state.lock().in_flight -= 1;
        }
    }
}

pub struct TtsBuffer {
    shared: Arc<Shared>,
}

impl TtsBuffer {
    /// Create the buffer and spawn its worker. The returned receiver fires
    /// once, after `close()` and once every dispatched cut has finished.
    pub fn new(
        config: TtsBufferConfig,
        language: String,
        model: Arc<TtsModel>,
        table: Arc<PhonemeTable>,
        renderer: Arc<dyn SpeechRenderer>,
        delivery: Arc<dyn AudioDelivery>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            language,
            model,
            table,
            renderer,
            delivery,
            state: Mutex::new(BufferState {
                pending: String::new(),
                first_arrival: None,
                timer_epoch: 0,
                closed: false,
                in_flight: 0,
                next_index: 0,
            }),
            work_tx: Mutex::new(Some(work_tx)),
        });
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_worker(shared.clone(), work_rx, done_tx));
        (Self { shared }, done_rx)
    }

    /// Append a streamed fragment and flush if the predicate allows.
    pub fn append(&self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.closed {
            warn!(language = %self.shared.language, "Fragment after close dropped");
            return;
        }
        if state.pending.is_empty() {
            let arrived = Instant::now();
            state.first_arrival = Some(arrived);
            state.timer_epoch += 1;
            self.arm_timer(state.timer_epoch, arrived + self.shared.config.max_wait);
        }
        state.pending.push_str(fragment);

        let words = word_count(&state.pending);
        if words >= self.shared.config.min_words {
            let cut = cut_point(&state.pending, self.shared.config.min_words);
            self.dispatch_cut(&mut state, cut, false);
        }
    }

    /// Unconditionally flush whatever is pending.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        let cut = state.pending.len();
        self.dispatch_cut(&mut state, cut, false);
    }

    /// Mark the buffer closed and flush the remainder. Completion fires once
    /// the worker drains.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let cut = state.pending.len();
            self.dispatch_cut(&mut state, cut, true);
        }
        // Dropping the sender lets the worker finish its queue and latch.
        self.shared.work_tx.lock().take();
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    #[cfg(test)]
    fn pending(&self) -> String {
        self.shared.state.lock().pending.clone()
    }

    /// Extract `pending[..cut]` and enqueue it for synthesis. Caller holds
    /// the state lock.
    fn dispatch_cut(&self, state: &mut BufferState, cut: usize, is_final: bool) {
        if cut == 0 {
            return;
        }
        let prefix: String = state.pending.drain(..cut).collect();
        if state.pending.is_empty() {
            state.first_arrival = None;
            state.timer_epoch += 1;
        } else {
            // A partial word stayed behind; treat it as a fresh arrival so it
            // cannot outlive the wait budget.
            let arrived = Instant::now();
            state.first_arrival = Some(arrived);
            state.timer_epoch += 1;
            self.arm_timer(state.timer_epoch, arrived + self.shared.config.max_wait);
        }
        if prefix.trim().is_empty() {
            return;
        }
        let index = state.next_index;
        state.next_index += 1;
        state.in_flight += 1;
        debug!(
            language = %self.shared.language,
            index,
            words = word_count(&prefix),
            "Dispatching TTS cut"
        );
        let accepted = self.shared.try_enqueue(WorkItem {
            text: prefix,
            index,
            is_final,
        });
        if !accepted {
            state.in_flight -= 1;
        }
    }

    fn arm_timer(&self, epoch: u64, deadline: Instant) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let item = {
                let mut state = shared.state.lock();
                if state.timer_epoch != epoch || state.closed || state.pending.trim().is_empty() {
                    return;
                }
                debug!(language = %shared.language, "Timer flushing TTS buffer");
                let prefix: String = state.pending.drain(..).collect();
                state.first_arrival = None;
                state.timer_epoch += 1;
                let index = state.next_index;
                state.next_index += 1;
                state.in_flight += 1;
                WorkItem {
                    text: prefix,
                    index,
                    is_final: false,
                }
            };
            shared.enqueue(item);
        });
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut work_rx: mpsc::UnboundedReceiver<WorkItem>,
    done_tx: oneshot::Sender<()>,
) {
    while let Some(item) = work_rx.recv().await {
        let result = shared
            .renderer
            .render(&item.text, &shared.model, &shared.table)
            .await;
        match result {
            Ok(audio) => {
                shared
                    .delivery
                    .audio_ready(AudioChunk {
                        text: item.text,
                        language: shared.language.clone(),
                        audio,
                        chunk_index: item.index,
                        is_final: item.is_final,
                    })
                    .await;
            }
            Err(err) => {
                warn!(language = %shared.language, error = %err, "Synthesis failed, dropping prefix");
                shared.delivery.synthesis_failed(&shared.language, &err).await;
            }
        }
        shared.state.lock().in_flight -= 1;
    }
    let _ = done_tx.send(());
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Largest cut that ends on a word boundary and still yields `min_words`.
/// Falls back to the whole buffer when the trailing partial word cannot be
/// spared.
fn cut_point(pending: &str, min_words: usize) -> usize {
    if pending
        .chars()
        .last()
        .map(|c| c.is_whitespace() || is_sentence_terminator(c))
        .unwrap_or(false)
    {
        return pending.len();
    }
    if let Some(pos) = pending.rfind(char::is_whitespace) {
        let boundary = pos + pending[pos..].chars().next().map_or(1, char::len_utf8);
        if word_count(&pending[..boundary]) >= min_words {
            return boundary;
        }
    }
    pending.len()
}

fn is_sentence_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | ':' | '。' | '！' | '？' | '；' | '：')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::tts::client::OUTPUT_MEDIA_TYPE;
    use parking_lot::Mutex as SyncMutex;

    struct RecordingRenderer {
        texts: SyncMutex<Vec<String>>,
        fail: bool,
        delay: Duration,
    }

    impl RecordingRenderer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                texts: SyncMutex::new(Vec::new()),
                fail: false,
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                texts: SyncMutex::new(Vec::new()),
                fail: true,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                texts: SyncMutex::new(Vec::new()),
                fail: false,
                delay,
            })
        }

        fn rendered(&self) -> Vec<String> {
            self.texts.lock().clone()
        }
    }

    #[async_trait]
    impl SpeechRenderer for RecordingRenderer {
        async fn render(
            &self,
            plain_text: &str,
            _model: &TtsModel,
            _table: &PhonemeTable,
        ) -> Result<SynthesizedAudio> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.texts.lock().push(plain_text.to_string());
            if self.fail {
                return Err(CoreError::TtsFailed("vendor down".into()));
            }
            Ok(SynthesizedAudio {
                bytes: plain_text.as_bytes().to_vec(),
                media_type: OUTPUT_MEDIA_TYPE.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingDelivery {
        chunks: SyncMutex<Vec<AudioChunk>>,
        failures: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl AudioDelivery for RecordingDelivery {
        async fn audio_ready(&self, chunk: AudioChunk) {
            self.chunks.lock().push(chunk);
        }

        async fn synthesis_failed(&self, _language: &str, error: &CoreError) {
            self.failures.lock().push(error.to_string());
        }
    }

    fn model() -> Arc<TtsModel> {
        Arc::new(TtsModel {
            language: "en-US".into(),
            name: "en-US-AriaNeural".into(),
            pitch: None,
            phoneme_url: None,
            case_sensitive: false,
        })
    }

    fn buffer_with(
        renderer: Arc<RecordingRenderer>,
        delivery: Arc<RecordingDelivery>,
    ) -> (TtsBuffer, oneshot::Receiver<()>) {
        TtsBuffer::new(
            TtsBufferConfig::default(),
            "en-US".into(),
            model(),
            Arc::new(PhonemeTable::empty()),
            renderer,
            delivery,
        )
    }

    #[tokio::test]
    async fn three_words_trigger_a_single_synthesis() {
        let renderer = RecordingRenderer::new();
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, done) = buffer_with(renderer.clone(), delivery.clone());

        buffer.append("Hello");
        buffer.append(" world this");
        buffer.close();
        done.await.unwrap();

        assert_eq!(renderer.rendered(), vec!["Hello world this".to_string()]);
        assert_eq!(buffer.pending(), "");
        assert_eq!(delivery.chunks.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_a_short_buffer_after_max_wait() {
        let renderer = RecordingRenderer::new();
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, _done) = buffer_with(renderer.clone(), delivery.clone());

        buffer.append("Hi");
        assert!(renderer.rendered().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(renderer.rendered(), vec!["Hi".to_string()]);
        assert_eq!(buffer.pending(), "");
    }

    #[tokio::test]
    async fn trailing_partial_word_stays_behind_when_affordable() {
        let renderer = RecordingRenderer::new();
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, _done) = buffer_with(renderer.clone(), delivery.clone());

        buffer.append("one two three four");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(renderer.rendered(), vec!["one two three ".to_string()]);
        assert_eq!(buffer.pending(), "four");
    }

    #[tokio::test]
    async fn rendered_texts_concatenate_to_the_input() {
        let renderer = RecordingRenderer::new();
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, done) = buffer_with(renderer.clone(), delivery.clone());

        let fragments = ["The quick ", "brown fox jumps", " over", " the lazy dog"];
        for fragment in fragments {
            buffer.append(fragment);
        }
        buffer.close();
        done.await.unwrap();

        let rendered = renderer.rendered();
        assert!(rendered.len() > 1, "expected multiple cuts");
        assert_eq!(rendered.concat(), fragments.concat());
        for text in &rendered[..rendered.len() - 1] {
            assert!(
                text.ends_with(|c: char| c.is_whitespace()),
                "non-final cut {text:?} must end on a word boundary"
            );
        }
    }

    #[tokio::test]
    async fn close_marks_the_final_chunk_and_fires_completion_once() {
        let renderer = RecordingRenderer::slow(Duration::from_millis(5));
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, done) = buffer_with(renderer.clone(), delivery.clone());

        buffer.append("one two three four five six ");
        buffer.append("tail");
        buffer.close();
        done.await.unwrap();

        assert_eq!(buffer.in_flight(), 0);
        let chunks = delivery.chunks.lock();
        assert!(!chunks.is_empty());
        assert!(chunks.last().unwrap().is_final);
        assert!(chunks[..chunks.len() - 1].iter().all(|c| !c.is_final));
    }

    #[tokio::test]
    async fn chunks_arrive_in_extraction_order() {
        let renderer = RecordingRenderer::slow(Duration::from_millis(2));
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, done) = buffer_with(renderer.clone(), delivery.clone());

        buffer.append("alpha beta gamma ");
        buffer.append("delta epsilon zeta ");
        buffer.append("eta theta iota ");
        buffer.close();
        done.await.unwrap();

        let chunks = delivery.chunks.lock();
        let indices: Vec<u64> = chunks.iter().map(|c| c.chunk_index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[tokio::test]
    async fn synthesis_failure_drops_prefix_and_still_completes() {
        let renderer = RecordingRenderer::failing();
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, done) = buffer_with(renderer.clone(), delivery.clone());

        buffer.append("these words will fail ");
        buffer.close();
        done.await.unwrap();

        assert!(delivery.chunks.lock().is_empty());
        assert_eq!(delivery.failures.lock().len(), 1);
        assert_eq!(buffer.in_flight(), 0);
    }

    #[tokio::test]
    async fn close_with_empty_buffer_completes_immediately() {
        let renderer = RecordingRenderer::new();
        let delivery = Arc::new(RecordingDelivery::default());
        let (buffer, done) = buffer_with(renderer.clone(), delivery.clone());

        buffer.close();
        done.await.unwrap();
        assert!(renderer.rendered().is_empty());
    }
}
