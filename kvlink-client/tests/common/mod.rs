#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kvlink_client::{ClientConfig, Connection, KVClient};
use parking_lot::Mutex;

pub const UNLOCK_SCRIPT_MARKER: &str = "redis.call('get',KEYS[1])==ARGV[1]";

enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

struct Entry {
    value: Value,
    expires: Option<Instant>,
}

#[derive(Default)]
struct Store {
    entries: HashMap<Vec<u8>, Entry>,
}

impl Store {
    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// In-process RESP server with a small Redis subset and lazy expiry.
pub struct MockServer {
    port: u16,
    store: Arc<Mutex<Store>>,
    accepted: Arc<Mutex<usize>>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::start_with_password("")
    }

    pub fn start_with_password(password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let store = Arc::new(Mutex::new(Store::default()));
        let accepted = Arc::new(Mutex::new(0));

        let password = password.to_string();
        let shared = Arc::clone(&store);
        let counter = Arc::clone(&accepted);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                *counter.lock() += 1;
                let store = Arc::clone(&shared);
                let password = password.clone();
                thread::spawn(move || serve(stream, store, password));
            }
        });

        MockServer {
            port,
            store,
            accepted,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        *self.accepted.lock()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().live(key.as_bytes()).is_some()
    }

    pub fn connection(&self) -> Connection {
        Connection::open("127.0.0.1", self.port, "", Duration::from_secs(2), 64 * 1024)
            .expect("connect to mock server")
    }

    pub fn client(&self, pool_size: usize) -> KVClient {
        let config = ClientConfig {
            port: self.port,
            pool_size,
            ..ClientConfig::default()
        };
        KVClient::with_config(config).expect("client")
    }
}

fn serve(stream: TcpStream, store: Arc<Mutex<Store>>, password: String) {
    let mut writer = stream.try_clone().expect("clone");
    let mut reader = BufReader::new(stream);
    let mut authed = password.is_empty();
    while let Ok(args) = read_command(&mut reader) {
        let reply = if args.is_empty() {
            error("ERR empty command")
        } else {
            let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
            if name == "AUTH" {
                if args.len() == 2 && args[1] == password.as_bytes() {
                    authed = true;
                    simple("OK")
                } else {
                    error("WRONGPASS invalid username-password pair")
                }
            } else if !authed {
                error("NOAUTH Authentication required.")
            } else {
                dispatch(&name, &args[1..], &mut store.lock())
            }
        };
        if writer.write_all(&reply).and_then(|()| writer.flush()).is_err() {
            break;
        }
    }
}

fn dispatch(name: &str, args: &[Vec<u8>], store: &mut Store) -> Vec<u8> {
    match (name, args.len()) {
        ("PING", 0) => simple("PONG"),
        ("SET", n) if n >= 2 => set(args, store),
        ("SETEX", 3) => match parse_i64(&args[1]) {
            Some(secs) if secs > 0 => {
                put_str(store, &args[0], args[2].clone(), Some(secs as u64));
                simple("OK")
            }
            _ => error("ERR invalid expire time in 'setex' command"),
        },
        ("GET", 1) => match store.live(&args[0]) {
            None => nil(),
            Some(Entry {
                value: Value::Str(data),
                ..
            }) => bulk(data),
            Some(_) => wrong_type(),
        },
        ("DEL", n) if n >= 1 => {
            let removed = args
                .iter()
                .filter(|key| {
                    store.live(key).is_some() && store.entries.remove(key.as_slice()).is_some()
                })
                .count();
            integer(removed as i64)
        }
        ("EXISTS", 1) => integer(store.live(&args[0]).is_some() as i64),
        ("EXPIRE", 2) => match (store.live(&args[0]), parse_i64(&args[1])) {
            (Some(entry), Some(secs)) => {
                entry.expires = Some(Instant::now() + Duration::from_secs(secs.max(0) as u64));
                integer(1)
            }
            (None, Some(_)) => integer(0),
            (_, None) => error("ERR value is not an integer or out of range"),
        },
        ("TTL", 1) => match store.live(&args[0]) {
            None => integer(-2),
            Some(Entry { expires: None, .. }) => integer(-1),
            Some(Entry {
                expires: Some(at), ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                integer(((remaining.as_millis() + 500) / 1000) as i64)
            }
        },
        ("INCRBY", 2) | ("DECRBY", 2) => {
            let Some(delta) = parse_i64(&args[1]) else {
                return error("ERR value is not an integer or out of range");
            };
            let delta = if name == "DECRBY" { -delta } else { delta };
            let current = match store.live(&args[0]) {
                None => 0,
                Some(Entry {
                    value: Value::Str(data),
                    ..
                }) => match parse_i64(data) {
                    Some(n) => n,
                    None => return error("ERR value is not an integer or out of range"),
                },
                Some(_) => return wrong_type(),
            };
            let next = current + delta;
            let expires = store.live(&args[0]).and_then(|entry| entry.expires);
            store.entries.insert(
                args[0].clone(),
                Entry {
                    value: Value::Str(next.to_string().into_bytes()),
                    expires,
                },
            );
            integer(next)
        }
        ("LPUSH", n) | ("RPUSH", n) if n >= 2 => {
            if !matches!(store.live(&args[0]), None | Some(Entry { value: Value::List(_), .. })) {
                return wrong_type();
            }
            let entry = store.entries.entry(args[0].clone()).or_insert(Entry {
                value: Value::List(VecDeque::new()),
                expires: None,
            });
            let Value::List(list) = &mut entry.value else {
                unreachable!("checked above");
            };
            for item in &args[1..] {
                if name == "LPUSH" {
                    list.push_front(item.clone());
                } else {
                    list.push_back(item.clone());
                }
            }
            integer(list.len() as i64)
        }
        ("LRANGE", 3) => {
            let (Some(start), Some(stop)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
                return error("ERR value is not an integer or out of range");
            };
            match store.live(&args[0]) {
                None => array(&[]),
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => {
                    let len = list.len() as i64;
                    let start = if start < 0 { (len + start).max(0) } else { start };
                    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
                    let items: Vec<Vec<u8>> = (start..=stop)
                        .filter_map(|idx| list.get(idx as usize).cloned())
                        .collect();
                    array(&items)
                }
                Some(_) => wrong_type(),
            }
        }
        ("EVAL", n) if n >= 2 => eval(args, store),
        _ => error(&format!("ERR unknown command '{}'", name.to_ascii_lowercase())),
    }
}

fn set(args: &[Vec<u8>], store: &mut Store) -> Vec<u8> {
    let mut nx = false;
    let mut ttl = None;
    let mut opts = args[2..].iter();
    while let Some(opt) = opts.next() {
        match opt.to_ascii_uppercase().as_slice() {
            b"NX" => nx = true,
            b"EX" => match opts.next().and_then(|raw| parse_i64(raw)) {
                Some(secs) if secs > 0 => ttl = Some(secs as u64),
                _ => return error("ERR invalid expire time in 'set' command"),
            },
            _ => return error("ERR syntax error"),
        }
    }
    if nx && store.live(&args[0]).is_some() {
        return nil();
    }
    put_str(store, &args[0], args[1].clone(), ttl);
    simple("OK")
}

fn eval(args: &[Vec<u8>], store: &mut Store) -> Vec<u8> {
    let script = String::from_utf8_lossy(&args[0]);
    let Some(numkeys) = parse_i64(&args[1]) else {
        return error("ERR value is not an integer or out of range");
    };
    let keys = &args[2..];
    if !script.contains(UNLOCK_SCRIPT_MARKER) || numkeys != 1 || keys.len() < 2 {
        return error("ERR unsupported script");
    }
    let (key, token) = (&keys[0], &keys[1]);
    let owned = matches!(
        store.live(key),
        Some(Entry { value: Value::Str(data), .. }) if data == token
    );
    if owned {
        store.entries.remove(key.as_slice());
        integer(1)
    } else {
        integer(0)
    }
}

fn put_str(store: &mut Store, key: &[u8], value: Vec<u8>, ttl_secs: Option<u64>) {
    store.entries.insert(
        key.to_vec(),
        Entry {
            value: Value::Str(value),
            expires: ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs)),
        },
    );
}

/// One step of a scripted exchange: read a command, then act.
pub enum Step {
    /// Write these bytes in one go.
    Reply(Vec<u8>),
    /// Write the bytes in two parts split at the index, pausing in between.
    Split(Vec<u8>, usize, Duration),
    /// Write nothing and keep the socket open.
    Silent,
    /// Close the socket.
    Close,
}

/// Serves one connection with a fixed script; every received command is
/// forwarded on the returned channel.
pub fn spawn_scripted(steps: Vec<Step>) -> (u16, Receiver<Vec<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (port, serve_scripted(listener, steps))
}

/// Like `spawn_scripted`, but listens on a fixed port.
pub fn spawn_scripted_on(port: u16, steps: Vec<Step>) -> Receiver<Vec<Vec<u8>>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).expect("bind");
    serve_scripted(listener, steps)
}

/// Accepts a single connection, then stops listening.
fn serve_scripted(listener: TcpListener, steps: Vec<Step>) -> Receiver<Vec<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        drop(listener);
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for step in steps {
            let Ok(args) = read_command(&mut reader) else {
                return;
            };
            let _ = tx.send(args);
            match step {
                Step::Reply(bytes) => {
                    let _ = stream.write_all(&bytes);
                    let _ = stream.flush();
                }
                Step::Split(bytes, at, pause) => {
                    let _ = stream.write_all(&bytes[..at]);
                    let _ = stream.flush();
                    thread::sleep(pause);
                    let _ = stream.write_all(&bytes[at..]);
                    let _ = stream.flush();
                }
                Step::Silent => {}
                Step::Close => return,
            }
        }
        // Hold the socket until the client hangs up.
        let mut sink = [0u8; 64];
        while matches!(reader.read(&mut sink), Ok(n) if n > 0) {}
    });

    rx
}

pub fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn parse_i64(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

pub fn simple(msg: &str) -> Vec<u8> {
    format!("+{}\r\n", msg).into_bytes()
}

pub fn error(msg: &str) -> Vec<u8> {
    format!("-{}\r\n", msg).into_bytes()
}

pub fn integer(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(&bulk(item));
    }
    out
}

fn wrong_type() -> Vec<u8> {
    error("WRONGTYPE Operation against a key holding the wrong kind of value")
}
