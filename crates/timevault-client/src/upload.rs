//! The upload pipeline: a parsed conversation in, an encrypted archive out.
//!
//! Two bounded queues, one consumer task each, run in strict phase order.
//! Media objects drain first: each is encrypted under a fresh one-off key,
//! stored, and polled until durable, so no message ever references a file
//! the server does not hold. Messages then flow through their own channel
//! in size-bounded batches. In both phases the producer encrypts ahead
//! while the consumer ships, and backpressure in the channel keeps memory
//! flat on large archives.
//!
//! Keys are derived locally from the expected sequence range. The server
//! confirms the assigned range on every batch; any disagreement aborts the
//! run before a single misencrypted message is stored. A rerun of the same
//! transcript skips whatever prefix the server already holds, so an
//! interrupted upload picks up where it stopped.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use timevault_core::model::CipherBlob;
use timevault_crypto::{Coordinate, DerivationChain, NONCE_SIZE, SymmetricKey, aead_encrypt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ClientError;
use crate::session::Session;
use crate::transport::{ArchiveTransport, Op};

/// Flush a message batch once its serialized size passes this.
pub const MESSAGE_BATCH_BYTES: usize = 50 * 1024;
/// Hard cap on messages per batch regardless of size.
pub const MAX_BATCH_MESSAGES: usize = 200;
/// Flush a media batch once its cumulative plaintext size passes this.
pub const MEDIA_BATCH_BYTES: usize = 2 * 1024 * 1024;
/// How many times to poll a stored media object before giving up.
pub const MEDIA_POLL_ATTEMPTS: u32 = 20;
/// Encrypted batches buffered between producer and uploader.
const BATCH_CHANNEL_DEPTH: usize = 4;

/// What one source message carries.
#[derive(Debug, Clone)]
pub enum SourcePayload {
    /// Plain text body.
    Text(String),
    /// A file attachment.
    Media {
        /// Raw file bytes.
        data: Vec<u8>,
        /// Declared MIME type.
        mime_type: String,
    },
}

/// One message from the parsed source conversation, in original order.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Original sender display name. System records carry none.
    pub sender: Option<String>,
    /// Original message time, unix seconds.
    pub date: i64,
    /// The payload.
    pub payload: SourcePayload,
}

/// Progress reported while an upload runs.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// A media object is durably stored.
    MediaStored {
        /// Objects stored so far.
        completed: usize,
        /// Objects in the run.
        total: usize,
    },
    /// A message batch is stored.
    BatchStored {
        /// First sequence of the batch.
        first_sequence: u64,
        /// Messages in the batch.
        count: u64,
    },
    /// Overall progress with a rough completion estimate.
    Progress {
        /// Messages stored so far.
        done: usize,
        /// Messages in the run.
        total: usize,
        /// Estimated time remaining, once enough has shipped to guess.
        eta: Option<Duration>,
    },
}

/// Summary of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Messages stored.
    pub messages: u64,
    /// Media objects stored.
    pub media: u64,
    /// Sequence assigned to the first message.
    pub first_sequence: u64,
}

struct EncryptedBatch {
    batch_id: String,
    first_sequence: u64,
    messages: Vec<Value>,
}

struct EncryptedMedia {
    item_index: usize,
    ciphertext: Vec<u8>,
    iv: [u8; NONCE_SIZE],
    mime_type: String,
    wrapped_key: CipherBlob,
}

struct MediaBatch {
    files: Vec<EncryptedMedia>,
}

/// Encrypt and upload a whole conversation.
///
/// `items` is the full transcript in original order. Whatever the server
/// already counts for `convo_id` is treated as the stored prefix of that
/// transcript and skipped, so rerunning after an interruption resumes at
/// the first missing message instead of storing duplicates. The caller
/// must be an admin of `convo_id` and the only writer while the run is in
/// flight; sequence keys are derived from the conversation's current
/// message count.
pub async fn upload_conversation<T: ArchiveTransport>(
    transport: &Arc<T>,
    session: &Session,
    convo_id: Uuid,
    master: &SymmetricKey,
    mut items: Vec<SourceItem>,
    events: Option<mpsc::Sender<UploadEvent>>,
) -> Result<UploadReport, ClientError> {
    let convos = session.list_conversations(transport.as_ref()).await?;
    let stored = convos
        .iter()
        .find(|c| c.id == convo_id)
        .ok_or_else(|| ClientError::BadResponse { reason: "conversation not visible".to_owned() })?
        .message_count;

    // The stored count is this transcript's prefix; only the tail is new.
    let skip = (stored as usize).min(items.len());
    let items = items.split_off(skip);
    if items.is_empty() {
        return Ok(UploadReport { messages: 0, media: 0, first_sequence: 0 });
    }
    if skip > 0 {
        tracing::info!(%convo_id, skipped = skip, "resuming after stored prefix");
    }
    let first_sequence = stored + 1;

    let mut chain = DerivationChain::new(master.as_bytes(), master.size());
    let sender_key = chain.sender_key();

    // Phase one: every media object, before any message references it.
    let media_refs =
        upload_media_objects(transport, session, convo_id, master, &mut chain, first_sequence, &items, &events)
            .await?;
    let media_count = media_refs.iter().filter(|r| r.is_some()).count() as u64;

    // Phase two: encrypt ahead, ship behind, bounded in between.
    let (batch_tx, batch_rx) = mpsc::channel::<EncryptedBatch>(BATCH_CHANNEL_DEPTH);
    let uploader = tokio::spawn(run_uploader(
        Arc::clone(transport),
        session.clone(),
        convo_id,
        items.len(),
        batch_rx,
        events.clone(),
    ));

    let mut batch: Vec<Value> = Vec::new();
    let mut batch_bytes = 0usize;
    let mut batch_first = first_sequence;
    let mut next_sequence = first_sequence;
    let mut producer_err = None;

    for (item, media_ref) in items.iter().zip(media_refs) {
        let coordinate = Coordinate::from_index(next_sequence - 1);
        let message_key = chain.message_key(coordinate);
        let wire = encrypt_item(item, media_ref, &sender_key, &message_key)?;
        batch_bytes += wire.to_string().len();
        batch.push(wire);
        next_sequence += 1;

        if batch_bytes >= MESSAGE_BATCH_BYTES || batch.len() >= MAX_BATCH_MESSAGES {
            let full = EncryptedBatch {
                batch_id: format!("batch-{batch_first:08}"),
                first_sequence: batch_first,
                messages: std::mem::take(&mut batch),
            };
            batch_first = next_sequence;
            batch_bytes = 0;
            if batch_tx.send(full).await.is_err() {
                // Uploader hung up; its join result carries the cause.
                producer_err = Some(());
                break;
            }
        }
    }
    if producer_err.is_none() && !batch.is_empty() {
        let tail = EncryptedBatch {
            batch_id: format!("batch-{batch_first:08}"),
            first_sequence: batch_first,
            messages: batch,
        };
        let _ = batch_tx.send(tail).await;
    }
    drop(batch_tx);

    let uploaded = uploader
        .await
        .map_err(|e| ClientError::Pipeline { reason: e.to_string() })??;

    Ok(UploadReport { messages: uploaded, media: media_count, first_sequence })
}

#[allow(clippy::too_many_arguments)]
async fn upload_media_objects<T: ArchiveTransport>(
    transport: &Arc<T>,
    session: &Session,
    convo_id: Uuid,
    master: &SymmetricKey,
    chain: &mut DerivationChain,
    first_sequence: u64,
    items: &[SourceItem],
    events: &Option<mpsc::Sender<UploadEvent>>,
) -> Result<Vec<Option<Value>>, ClientError> {
    let total = items
        .iter()
        .filter(|i| matches!(i.payload, SourcePayload::Media { .. }))
        .count();
    let mut refs: Vec<Option<Value>> = vec![None; items.len()];
    if total == 0 {
        return Ok(refs);
    }

    let (media_tx, media_rx) = mpsc::channel::<MediaBatch>(BATCH_CHANNEL_DEPTH);
    let consumer = tokio::spawn(run_media_uploader(
        Arc::clone(transport),
        session.clone(),
        convo_id,
        total,
        media_rx,
        events.clone(),
    ));

    let mut pending: Vec<EncryptedMedia> = Vec::new();
    let mut pending_bytes = 0usize;
    let mut hung_up = false;

    for (offset, item) in items.iter().enumerate() {
        let SourcePayload::Media { data, mime_type } = &item.payload else {
            continue;
        };
        let sequence = first_sequence + offset as u64;
        let message_key = chain.message_key(Coordinate::from_index(sequence - 1));

        // One-off key per file, held only inside the owning message.
        let file_key = SymmetricKey::generate(master.size());
        let body_ct = aead_encrypt(&file_key, data);
        let wrapped_key = CipherBlob::from_aead(&aead_encrypt(&message_key, file_key.as_bytes()));

        pending_bytes += data.len();
        pending.push(EncryptedMedia {
            item_index: offset,
            ciphertext: body_ct.ciphertext,
            iv: body_ct.nonce,
            mime_type: mime_type.clone(),
            wrapped_key,
        });

        if pending_bytes >= MEDIA_BATCH_BYTES {
            pending_bytes = 0;
            if media_tx.send(MediaBatch { files: std::mem::take(&mut pending) }).await.is_err() {
                // Consumer hung up; its join result carries the cause.
                hung_up = true;
                break;
            }
        }
    }
    if !hung_up && !pending.is_empty() {
        let _ = media_tx.send(MediaBatch { files: pending }).await;
    }
    drop(media_tx);

    let stored =
        consumer.await.map_err(|e| ClientError::Pipeline { reason: e.to_string() })??;
    for (index, media_ref) in stored {
        refs[index] = Some(media_ref);
    }
    Ok(refs)
}

async fn run_media_uploader<T: ArchiveTransport>(
    transport: Arc<T>,
    session: Session,
    convo_id: Uuid,
    total: usize,
    mut batches: mpsc::Receiver<MediaBatch>,
    events: Option<mpsc::Sender<UploadEvent>>,
) -> Result<Vec<(usize, Value)>, ClientError> {
    let mut stored = Vec::new();
    while let Some(batch) = batches.recv().await {
        for file in batch.files {
            let body = json!({
                "convoId": convo_id,
                "ciphertext": BASE64.encode(&file.ciphertext),
                "iv": BASE64.encode(file.iv),
                "mimeType": file.mime_type,
            });
            let reply = session.call(transport.as_ref(), Op::UploadMedia, &body).await?;
            let media_id = reply
                .get("mediaId")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| ClientError::BadResponse { reason: "missing mediaId".to_owned() })?;

            poll_media_ready(transport.as_ref(), &session, convo_id, media_id).await?;

            stored.push((
                file.item_index,
                json!({
                    "mediaId": media_id,
                    "encryptedMediaKey": file.wrapped_key,
                }),
            ));
            if let Some(events) = &events {
                let _ =
                    events.send(UploadEvent::MediaStored { completed: stored.len(), total }).await;
            }
        }
    }
    Ok(stored)
}

async fn poll_media_ready<T: ArchiveTransport>(
    transport: &T,
    session: &Session,
    convo_id: Uuid,
    media_id: Uuid,
) -> Result<(), ClientError> {
    let body = json!({ "convoId": convo_id, "mediaId": media_id });
    for attempt in 1..=MEDIA_POLL_ATTEMPTS {
        let reply = session.call(transport, Op::MediaReady, &body).await?;
        if reply.get("ready").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let backoff = Duration::from_millis(100).saturating_mul(attempt).min(Duration::from_secs(2));
        tokio::time::sleep(backoff).await;
    }
    Err(ClientError::MediaTimeout { media_id, attempts: MEDIA_POLL_ATTEMPTS })
}

fn encrypt_item(
    item: &SourceItem,
    media_ref: Option<Value>,
    sender_key: &SymmetricKey,
    message_key: &SymmetricKey,
) -> Result<Value, ClientError> {
    let sender = item
        .sender
        .as_ref()
        .map(|name| CipherBlob::from_aead(&aead_encrypt(sender_key, name.as_bytes())));
    match (&item.payload, media_ref) {
        (SourcePayload::Text(text), None) => {
            let content = CipherBlob::from_aead(&aead_encrypt(message_key, text.as_bytes()));
            Ok(json!({
                "sender": sender,
                "date": item.date,
                "type": "text",
                "content": content,
            }))
        }
        (SourcePayload::Media { .. }, Some(media_ref)) => Ok(json!({
            "sender": sender,
            "date": item.date,
            "type": "media",
            "media": media_ref,
        })),
        _ => Err(ClientError::Pipeline {
            reason: "media reference does not match item payload".to_owned(),
        }),
    }
}

async fn run_uploader<T: ArchiveTransport>(
    transport: Arc<T>,
    session: Session,
    convo_id: Uuid,
    total_messages: usize,
    mut batches: mpsc::Receiver<EncryptedBatch>,
    events: Option<mpsc::Sender<UploadEvent>>,
) -> Result<u64, ClientError> {
    let started = tokio::time::Instant::now();
    let mut done = 0u64;

    while let Some(batch) = batches.recv().await {
        let count = batch.messages.len() as u64;
        let body = json!({
            "convoId": convo_id,
            "batchId": batch.batch_id,
            "messages": batch.messages,
        });
        let reply = session.call(transport.as_ref(), Op::UploadMessages, &body).await?;
        let assigned = reply
            .get("firstSequence")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::BadResponse { reason: "missing firstSequence".to_owned() })?;
        if assigned != batch.first_sequence {
            return Err(ClientError::SequenceMismatch {
                expected: batch.first_sequence,
                got: assigned,
            });
        }

        done += count;
        tracing::debug!(first = batch.first_sequence, count, "batch stored");
        if let Some(events) = &events {
            let _ = events
                .send(UploadEvent::BatchStored { first_sequence: batch.first_sequence, count })
                .await;
            let eta = (done > 0).then(|| {
                let per_message = started.elapsed() / done.max(1) as u32;
                per_message.saturating_mul((total_messages as u64 - done) as u32)
            });
            let _ = events
                .send(UploadEvent::Progress { done: done as usize, total: total_messages, eta })
                .await;
        }
    }
    Ok(done)
}
