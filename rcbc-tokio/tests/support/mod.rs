//! An in-process stand-in for a cluster node: a TCP listener speaking
//! enough of the KV binary protocol to exercise the whole client stack,
//! backed by a shared in-memory store. Connections can be killed and the
//! node can be stalled to provoke recovery and timeout paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const HEADER_LEN: usize = 24;

const STATUS_SUCCESS: u16 = 0x00;
const STATUS_KEY_NOT_FOUND: u16 = 0x01;
const STATUS_KEY_EXISTS: u16 = 0x02;
const STATUS_NOT_STORED: u16 = 0x05;
const STATUS_LOCKED: u16 = 0x09;
const STATUS_SUBDOC_PATH_NOT_FOUND: u16 = 0xc0;
const STATUS_SUBDOC_MULTI_PATH_FAILURE: u16 = 0xcc;

#[derive(Clone)]
struct Doc {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

struct Request {
    opcode: u8,
    opaque: u32,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

struct Reply {
    status: u16,
    cas: u64,
    extras: Vec<u8>,
    value: Vec<u8>,
}

impl Reply {
    fn status(status: u16) -> Reply {
        Reply {
            status,
            cas: 0,
            extras: Vec::new(),
            value: Vec::new(),
        }
    }
}

pub struct MockNode {
    pub port: u16,
    store: Mutex<HashMap<Vec<u8>, Doc>>,
    cas_counter: AtomicU64,
    cids: Mutex<HashMap<String, u32>>,
    next_cid: AtomicU32,
    stall: AtomicBool,
    conns: Mutex<Vec<CancellationToken>>,
    accept_token: CancellationToken,
}

impl MockNode {
    pub async fn start() -> Arc<MockNode> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = Arc::new(MockNode {
            port,
            store: Mutex::new(HashMap::new()),
            cas_counter: AtomicU64::new(1),
            cids: Mutex::new(HashMap::new()),
            next_cid: AtomicU32::new(123),
            stall: AtomicBool::new(false),
            conns: Mutex::new(Vec::new()),
            accept_token: CancellationToken::new(),
        });

        let accept_node = node.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_node.accept_token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(_) => return,
                };
                let kill = CancellationToken::new();
                accept_node.conns.lock().unwrap().push(kill.clone());
                let conn_node = accept_node.clone();
                tokio::spawn(async move {
                    conn_node.serve(stream, kill).await;
                });
            }
        });
        node
    }

    /// Drop every open connection; the listener stays up so recovery can
    /// reconnect.
    pub fn kill_connections(&self) {
        for token in self.conns.lock().unwrap().drain(..) {
            token.cancel();
        }
    }

    /// While stalled, requests are consumed but never answered.
    pub fn set_stall(&self, on: bool) {
        self.stall.store(on, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        self.accept_token.cancel();
        self.kill_connections();
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn serve(&self, mut stream: TcpStream, kill: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = kill.cancelled() => return,
                request = read_request(&mut stream) => match request {
                    Some(request) => request,
                    None => return,
                },
            };
            if self.stall.load(Ordering::Relaxed) {
                continue;
            }
            let reply = self.handle(&request);
            let frame = write_reply(&request, &reply);
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    fn handle(&self, req: &Request) -> Reply {
        match req.opcode {
            0x00 | 0x83 | 0x1d | 0x94 => self.handle_get(req),
            0x01 => self.handle_set(req),
            0x02 => self.handle_add(req),
            0x03 => self.handle_replace(req),
            0x04 => self.handle_delete(req),
            0x05 => self.handle_counter(req, true),
            0x06 => self.handle_counter(req, false),
            0x0e => self.handle_concat(req, true),
            0x0f => self.handle_concat(req, false),
            0x1c => self.handle_touch(req),
            0x95 => self.handle_unlock(req),
            0x92 => self.handle_observe(req),
            0xbb => self.handle_get_cid(req),
            0xd0 => self.handle_multi_lookup(req),
            0xd1 => self.handle_multi_mutation(req),
            _ => Reply::status(0x81), // unknown command
        }
    }

    fn handle_get(&self, req: &Request) -> Reply {
        let store = self.store.lock().unwrap();
        match store.get(&req.key) {
            Some(doc) => {
                let mut extras = BytesMut::new();
                extras.put_u32(doc.flags);
                Reply {
                    status: STATUS_SUCCESS,
                    cas: doc.cas,
                    extras: extras.to_vec(),
                    value: doc.value.clone(),
                }
            }
            None => Reply::status(STATUS_KEY_NOT_FOUND),
        }
    }

    fn handle_set(&self, req: &Request) -> Reply {
        let mut store = self.store.lock().unwrap();
        if req.cas != 0 {
            match store.get(&req.key) {
                None => return Reply::status(STATUS_KEY_NOT_FOUND),
                Some(doc) if doc.cas != req.cas => return Reply::status(STATUS_KEY_EXISTS),
                Some(_) => {}
            }
        }
        let flags = read_u32(&req.extras, 0);
        self.insert(&mut store, req, flags)
    }

    fn handle_add(&self, req: &Request) -> Reply {
        let mut store = self.store.lock().unwrap();
        if store.contains_key(&req.key) {
            return Reply::status(STATUS_KEY_EXISTS);
        }
        let flags = read_u32(&req.extras, 0);
        self.insert(&mut store, req, flags)
    }

    fn handle_replace(&self, req: &Request) -> Reply {
        let mut store = self.store.lock().unwrap();
        match store.get(&req.key) {
            None => return Reply::status(STATUS_KEY_NOT_FOUND),
            Some(doc) if req.cas != 0 && doc.cas != req.cas => {
                return Reply::status(STATUS_KEY_EXISTS)
            }
            Some(_) => {}
        }
        let flags = read_u32(&req.extras, 0);
        self.insert(&mut store, req, flags)
    }

    fn insert(&self, store: &mut HashMap<Vec<u8>, Doc>, req: &Request, flags: u32) -> Reply {
        let cas = self.next_cas();
        store.insert(
            req.key.clone(),
            Doc {
                value: req.value.clone(),
                flags,
                cas,
            },
        );
        mutation_reply(cas)
    }

    fn handle_delete(&self, req: &Request) -> Reply {
        let mut store = self.store.lock().unwrap();
        match store.get(&req.key) {
            None => return Reply::status(STATUS_KEY_NOT_FOUND),
            Some(doc) if req.cas != 0 && doc.cas != req.cas => {
                return Reply::status(STATUS_KEY_EXISTS)
            }
            Some(_) => {}
        }
        store.remove(&req.key);
        mutation_reply(self.next_cas())
    }

    fn handle_counter(&self, req: &Request, up: bool) -> Reply {
        let delta = read_u64(&req.extras, 0);
        let initial = read_u64(&req.extras, 8);
        let mut store = self.store.lock().unwrap();
        let current = store
            .get(&req.key)
            .and_then(|doc| std::str::from_utf8(&doc.value).ok()?.parse::<u64>().ok());
        let next = match current {
            None => initial,
            Some(value) if up => value.wrapping_add(delta),
            Some(value) => value.saturating_sub(delta),
        };
        let cas = self.next_cas();
        store.insert(
            req.key.clone(),
            Doc {
                value: next.to_string().into_bytes(),
                flags: 0,
                cas,
            },
        );
        let mut value = BytesMut::new();
        value.put_u64(next);
        Reply {
            status: STATUS_SUCCESS,
            cas,
            extras: Vec::new(),
            value: value.to_vec(),
        }
    }

    fn handle_concat(&self, req: &Request, append: bool) -> Reply {
        let mut store = self.store.lock().unwrap();
        let doc = match store.get_mut(&req.key) {
            Some(doc) => doc,
            None => return Reply::status(STATUS_NOT_STORED),
        };
        if append {
            doc.value.extend_from_slice(&req.value);
        } else {
            let mut value = req.value.clone();
            value.extend_from_slice(&doc.value);
            doc.value = value;
        }
        doc.cas = self.next_cas();
        mutation_reply(doc.cas)
    }

    fn handle_touch(&self, req: &Request) -> Reply {
        let store = self.store.lock().unwrap();
        match store.get(&req.key) {
            Some(doc) => Reply {
                status: STATUS_SUCCESS,
                cas: doc.cas,
                extras: Vec::new(),
                value: Vec::new(),
            },
            None => Reply::status(STATUS_KEY_NOT_FOUND),
        }
    }

    fn handle_unlock(&self, req: &Request) -> Reply {
        let store = self.store.lock().unwrap();
        match store.get(&req.key) {
            None => Reply::status(STATUS_KEY_NOT_FOUND),
            Some(doc) if doc.cas != req.cas => Reply::status(STATUS_LOCKED),
            Some(_) => Reply::status(STATUS_SUCCESS),
        }
    }

    fn handle_observe(&self, req: &Request) -> Reply {
        // Body: vbucket, key length, key.
        let vbucket = read_u16(&req.value, 0);
        let key_len = read_u16(&req.value, 2) as usize;
        let key = req.value[4..4 + key_len].to_vec();
        let store = self.store.lock().unwrap();
        let (state, cas) = match store.get(&key) {
            Some(doc) => (0x01u8, doc.cas),
            None => (0x80u8, 0),
        };
        let mut value = BytesMut::new();
        value.put_u16(vbucket);
        value.put_u16(key_len as u16);
        value.put_slice(&key);
        value.put_u8(state);
        value.put_u64(cas);
        Reply {
            status: STATUS_SUCCESS,
            cas: 0,
            extras: Vec::new(),
            value: value.to_vec(),
        }
    }

    fn handle_get_cid(&self, req: &Request) -> Reply {
        let name = String::from_utf8_lossy(&req.value).to_string();
        let mut cids = self.cids.lock().unwrap();
        let next = &self.next_cid;
        let cid = *cids
            .entry(name)
            .or_insert_with(|| next.fetch_add(1, Ordering::Relaxed));
        let mut extras = BytesMut::new();
        extras.put_u64(1); // manifest uid
        extras.put_u32(cid);
        Reply {
            status: STATUS_SUCCESS,
            cas: 0,
            extras: extras.to_vec(),
            value: Vec::new(),
        }
    }

    fn handle_multi_lookup(&self, req: &Request) -> Reply {
        let doc = match self.store.lock().unwrap().get(&req.key).cloned() {
            Some(doc) => doc,
            None => return Reply::status(STATUS_KEY_NOT_FOUND),
        };
        let parsed: Value = serde_json::from_slice(&doc.value).unwrap_or(Value::Null);

        let mut results = BytesMut::new();
        let mut any_failed = false;
        let mut offset = 0;
        while offset + 4 <= req.value.len() {
            let path_len = read_u16(&req.value, offset + 2) as usize;
            let path =
                String::from_utf8_lossy(&req.value[offset + 4..offset + 4 + path_len]).to_string();
            offset += 4 + path_len;

            let found = if path == "$document.exptime" {
                Some(Value::from(0u32))
            } else {
                lookup_path(&parsed, &path).cloned()
            };
            match found {
                Some(value) => {
                    let bytes = serde_json::to_vec(&value).unwrap();
                    results.put_u16(STATUS_SUCCESS);
                    results.put_u32(bytes.len() as u32);
                    results.put_slice(&bytes);
                }
                None => {
                    any_failed = true;
                    results.put_u16(STATUS_SUBDOC_PATH_NOT_FOUND);
                    results.put_u32(0);
                }
            }
        }
        Reply {
            status: if any_failed {
                STATUS_SUBDOC_MULTI_PATH_FAILURE
            } else {
                STATUS_SUCCESS
            },
            cas: doc.cas,
            extras: Vec::new(),
            value: results.to_vec(),
        }
    }

    fn handle_multi_mutation(&self, req: &Request) -> Reply {
        let mut store = self.store.lock().unwrap();
        // Doc flags ride in the last extras byte when present.
        let doc_flags = req.extras.last().copied().unwrap_or(0);
        let mut parsed = match store.get(&req.key) {
            Some(doc) => serde_json::from_slice(&doc.value).unwrap_or(Value::Null),
            None if doc_flags & 0x03 != 0 => Value::Object(Map::new()),
            None => return Reply::status(STATUS_KEY_NOT_FOUND),
        };

        let mut entries = BytesMut::new();
        let mut offset = 0;
        let mut index = 0u8;
        while offset + 8 <= req.value.len() {
            let op = req.value[offset];
            let path_len = read_u16(&req.value, offset + 2) as usize;
            let value_len = read_u32(&req.value, offset + 4) as usize;
            let path = String::from_utf8_lossy(
                &req.value[offset + 8..offset + 8 + path_len],
            )
            .to_string();
            let spec_value = &req.value[offset + 8 + path_len..offset + 8 + path_len + value_len];
            offset += 8 + path_len + value_len;

            match op {
                // Delete
                0xc9 => {
                    remove_path(&mut parsed, &path);
                }
                // Counter: reply carries the post-mutation value.
                0xcf => {
                    let delta: i64 = serde_json::from_slice(spec_value).unwrap_or(0);
                    let current = lookup_path(&parsed, &path)
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let next = current + delta;
                    insert_path(&mut parsed, &path, Value::from(next));
                    let bytes = next.to_string().into_bytes();
                    entries.put_u8(index);
                    entries.put_u16(STATUS_SUCCESS);
                    entries.put_u32(bytes.len() as u32);
                    entries.put_slice(&bytes);
                }
                // Dict/array writes all behave as path upserts here.
                _ => {
                    let value: Value =
                        serde_json::from_slice(spec_value).unwrap_or(Value::Null);
                    insert_path(&mut parsed, &path, value);
                }
            }
            index += 1;
        }

        let cas = self.next_cas();
        store.insert(
            req.key.clone(),
            Doc {
                value: serde_json::to_vec(&parsed).unwrap(),
                flags: 0x0200_0000,
                cas,
            },
        );
        let mut reply = mutation_reply(cas);
        reply.value = entries.to_vec();
        reply
    }
}

fn mutation_reply(cas: u64) -> Reply {
    let mut extras = BytesMut::new();
    extras.put_u64(0xfeed); // vbucket uuid
    extras.put_u64(cas); // seqno
    Reply {
        status: STATUS_SUCCESS,
        cas,
        extras: extras.to_vec(),
        value: Vec::new(),
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.ok()?;
    let magic = header[0];
    let (framing_len, key_len) = match magic {
        0x08 => (header[2] as usize, header[3] as usize),
        _ => (0, read_u16(&header, 2) as usize),
    };
    let extras_len = header[4] as usize;
    let body_len = read_u32(&header, 8) as usize;
    let opaque = read_u32(&header, 12);
    let cas = read_u64(&header, 16);
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await.ok()?;

    let extras_start = framing_len;
    let key_start = extras_start + extras_len;
    let value_start = key_start + key_len;
    Some(Request {
        opcode: header[1],
        opaque,
        cas,
        extras: body[extras_start..key_start].to_vec(),
        key: body[key_start..value_start].to_vec(),
        value: body[value_start..].to_vec(),
    })
}

fn write_reply(req: &Request, reply: &Reply) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(0x81);
    buf.put_u8(req.opcode);
    buf.put_u16(0); // responses here never carry a key
    buf.put_u8(reply.extras.len() as u8);
    buf.put_u8(0);
    buf.put_u16(reply.status);
    buf.put_u32((reply.extras.len() + reply.value.len()) as u32);
    buf.put_u32(req.opaque);
    buf.put_u64(reply.cas);
    buf.put_slice(&reply.extras);
    buf.put_slice(&reply.value);
    buf.to_vec()
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(out)
}

fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, segment| value.get(segment))
}

fn insert_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let map = match current {
            Value::Object(map) => map,
            _ => return,
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn remove_path(target: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = target;
    for segment in &segments[..segments.len() - 1] {
        current = match current.get_mut(*segment) {
            Some(next) => next,
            None => return,
        };
    }
    if let Value::Object(map) = current {
        map.remove(segments[segments.len() - 1]);
    }
}
