//! Decoding sessions: a request/response protocol over a worker thread.
//!
//! Decoding a multi-GB record stream takes long enough that callers want it
//! off their own thread. A [`Session`] owns the opened file on a dedicated
//! worker and speaks a small message protocol: a decode request answers with
//! [`Response::Started`] carrying live sequence readers before any record
//! bytes stream, then progress events while the stream decodes, then exactly
//! one [`Response::Decoded`]. The readers observe the decoder's storage
//! directly and stay valid across buffer growth, so they are handed out once
//! and never re-sent. Decoded streams are cached per data group; a second
//! signal from the same group answers immediately with its samples already
//! complete. A failed request reports [`Response::Failed`] and leaves the
//! session usable; only dropping the [`Session`] ends the worker.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use log::debug;

use crate::{
    read::{DecodedChannel, DecodedStream, MdfFile, SignalInfo},
    MdfError, MdfResult,
};

/// Messages into the worker.
#[derive(Debug, Clone)]
pub enum Request {
    /// Reply with the full signal catalog.
    ListSignals,
    /// Decode the stream holding `signal` and reply with its samples.
    Decode { signal: u32 },
    /// Stop the worker. Dropping the session sends this implicitly.
    Shutdown,
}

/// Messages out of the worker.
pub enum Response {
    Signals(Vec<SignalInfo>),
    /// Sent before a stream decodes. The readers are live: samples appear
    /// in them as decoding progresses. Not sent for cache hits, whose
    /// samples are already complete when [`Response::Decoded`] arrives.
    Started {
        signal: u32,
        channel: DecodedChannel,
        master: Option<DecodedChannel>,
    },
    /// Emitted while a stream decodes; `done`/`total` are byte counts.
    Progress { signal: u32, done: u64, total: u64 },
    /// Completion: the channel's samples are fully decoded.
    Decoded {
        signal: u32,
        channel: DecodedChannel,
        /// The group's master channel, absent when the group declares none.
        master: Option<DecodedChannel>,
    },
    /// The request failed; the session remains usable.
    Failed { signal: Option<u32>, error: MdfError },
}

/// Handle to a decoding worker. Requests are processed in order.
pub struct Session {
    requests: mpsc::Sender<Request>,
    responses: mpsc::Receiver<Response>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Move an opened file onto a worker thread.
    pub fn spawn<R>(file: MdfFile<R>) -> MdfResult<Session>
    where
        R: Read + Seek + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("mdf-decoder".into())
            .spawn(move || worker_loop(file, req_rx, resp_tx))?;
        Ok(Session {
            requests: req_tx,
            responses: resp_rx,
            worker: Some(worker),
        })
    }

    /// Queue a request. Returns false if the worker is gone.
    pub fn request(&self, request: Request) -> bool {
        self.requests.send(request).is_ok()
    }

    /// Block for the next response; `None` once the worker has exited.
    pub fn response(&self) -> Option<Response> {
        self.responses.recv().ok()
    }

    pub fn try_response(&self) -> Option<Response> {
        self.responses.try_recv().ok()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop<R: Read + Seek>(
    mut file: MdfFile<R>,
    requests: mpsc::Receiver<Request>,
    responses: mpsc::Sender<Response>,
) {
    let mut cache: HashMap<usize, Arc<DecodedStream>> = HashMap::new();
    while let Ok(request) = requests.recv() {
        let reply = match request {
            Request::ListSignals => Response::Signals(file.signals().to_vec()),
            Request::Decode { signal } => {
                match decode(&mut file, &mut cache, signal, &responses) {
                    Ok((channel, master)) => Response::Decoded {
                        signal,
                        channel,
                        master,
                    },
                    Err(error) => Response::Failed {
                        signal: Some(signal),
                        error,
                    },
                }
            }
            Request::Shutdown => break,
        };
        if responses.send(reply).is_err() {
            // Caller dropped the session mid-request.
            break;
        }
    }
    debug!("decoder worker exiting");
}

fn decode<R: Read + Seek>(
    file: &mut MdfFile<R>,
    cache: &mut HashMap<usize, Arc<DecodedStream>>,
    signal: u32,
    responses: &mpsc::Sender<Response>,
) -> MdfResult<(DecodedChannel, Option<DecodedChannel>)> {
    let stream = file
        .signals()
        .iter()
        .find(|s| s.id == signal)
        .map(|s| s.stream)
        .ok_or(MdfError::UnknownSignal(signal))?;

    let decoded = match cache.get(&stream) {
        Some(decoded) => Arc::clone(decoded),
        None => {
            let decoded = Arc::new(file.decode_stream_live(
                stream,
                |early| {
                    if let Ok(channel) = early.channel(signal) {
                        let _ = responses.send(Response::Started {
                            signal,
                            channel: channel.clone(),
                            master: early.master_of(signal).ok().cloned(),
                        });
                    }
                },
                |done, total| {
                    let _ = responses.send(Response::Progress {
                        signal,
                        done,
                        total,
                    });
                },
            )?);
            cache.insert(stream, Arc::clone(&decoded));
            decoded
        }
    };

    let channel = decoded.channel(signal)?.clone();
    let master = decoded.master_of(signal).ok().cloned();
    Ok((channel, master))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::{ChannelDef, FileWriter};
    use std::io::Cursor;

    fn session_fixture() -> Session {
        let mut w = FileWriter::new(Cursor::new(Vec::new()));
        let g = w.add_group(vec![
            ChannelDef::new("time").master(),
            ChannelDef::new("rpm"),
        ]);
        for i in 0..100 {
            w.append_row(g, &[i as f64 * 0.01, 800.0 + i as f64]).unwrap();
        }
        let bytes = w.finish().unwrap().into_inner();
        let file = MdfFile::open(Cursor::new(bytes)).unwrap();
        Session::spawn(file).unwrap()
    }

    fn decode_collect(session: &Session, signal: u32) -> (usize, Option<Response>) {
        assert!(session.request(Request::Decode { signal }));
        let mut progress = 0;
        loop {
            match session.response() {
                Some(Response::Started { .. }) => {}
                Some(Response::Progress { .. }) => progress += 1,
                other => return (progress, other),
            }
        }
    }

    #[test]
    fn lists_signals() {
        let session = session_fixture();
        assert!(session.request(Request::ListSignals));
        match session.response() {
            Some(Response::Signals(signals)) => {
                assert_eq!(signals.len(), 2);
                assert_eq!(signals[1].name, "rpm");
            }
            _ => panic!("expected a signal catalog"),
        }
    }

    #[test]
    fn reader_handles_arrive_before_completion() {
        let session = session_fixture();
        assert!(session.request(Request::Decode { signal: 1 }));
        // The first response hands out live readers, ahead of any progress
        // or completion.
        let channel = match session.response() {
            Some(Response::Started {
                signal,
                channel,
                master,
            }) => {
                assert_eq!(signal, 1);
                assert!(master.is_some());
                channel
            }
            _ => panic!("expected reader handles before completion"),
        };
        loop {
            match session.response() {
                Some(Response::Progress { .. }) => {}
                Some(Response::Decoded { channel: done, .. }) => {
                    assert_eq!(done.samples.len(), 100);
                    break;
                }
                _ => panic!("expected progress or completion"),
            }
        }
        // The early handle observes the same storage the decoder filled.
        assert_eq!(channel.samples.len(), 100);
        assert_eq!(channel.samples.value_at(0), Some(800.0));
    }

    #[test]
    fn decodes_with_progress_and_master() {
        let session = session_fixture();
        let (progress, last) = decode_collect(&session, 1);
        assert!(progress > 0);
        match last {
            Some(Response::Decoded {
                signal,
                channel,
                master,
            }) => {
                assert_eq!(signal, 1);
                assert_eq!(channel.samples.len(), 100);
                assert_eq!(channel.samples.value_at(0), Some(800.0));
                let master = master.expect("group has a master channel");
                assert_eq!(master.samples.value_at(1), Some(0.01));
            }
            _ => panic!("expected a decoded response"),
        }
    }

    #[test]
    fn second_signal_in_group_answers_from_cache() {
        let session = session_fixture();
        let (first_progress, _) = decode_collect(&session, 1);
        assert!(first_progress > 0);
        // Same stream: no second decode pass, so no progress events.
        let (second_progress, last) = decode_collect(&session, 0);
        assert_eq!(second_progress, 0);
        assert!(matches!(last, Some(Response::Decoded { signal: 0, .. })));
    }

    #[test]
    fn failed_request_leaves_session_usable() {
        let session = session_fixture();
        let (_, response) = decode_collect(&session, 99);
        match response {
            Some(Response::Failed { signal, error }) => {
                assert_eq!(signal, Some(99));
                assert!(matches!(error, MdfError::UnknownSignal(99)));
            }
            _ => panic!("expected a failure response"),
        }
        let (_, response) = decode_collect(&session, 1);
        assert!(matches!(response, Some(Response::Decoded { .. })));
    }
}
