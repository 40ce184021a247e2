//! In-process fake of an inline-protocol key-value server
//!
//! Keeps strings and hashes in memory with expiry, supports `MULTI`/`EXEC`,
//! and can be told to misbehave per command: answer with canned bytes, stay
//! silent, answer late, hang up, or dribble every reply out in pieces.

use kvcache::NetworkSettings;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

/// Misbehaviour for one command name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with these raw bytes instead of executing the command
    Reply(String),
    /// Read the command and never answer
    Silence,
    /// Close the connection
    Hangup,
    /// Execute the command but hold its reply back this long
    Late(Duration),
}

#[derive(Debug, Clone)]
struct FaultRule {
    fault: Fault,
    /// Occurrences still to pass through untouched
    skip: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Text(Vec<u8>),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    faults: HashMap<String, FaultRule>,
    split: Option<Duration>,
    log: Vec<Vec<String>>,
}

impl State {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now());
        if expired {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn take_fault(&mut self, name: &str) -> Option<Fault> {
        let rule = self.faults.get_mut(name)?;
        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }
        Some(rule.fault.clone())
    }
}

enum Out {
    Status(&'static str),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<Out>),
}

impl Out {
    fn ok() -> Self {
        Out::Status("OK")
    }

    fn wrong_type() -> Self {
        Out::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Out::Status(s) => buf.extend_from_slice(format!("+{s}\r\n").as_bytes()),
            Out::Error(s) => buf.extend_from_slice(format!("-{s}\r\n").as_bytes()),
            Out::Integer(n) => buf.extend_from_slice(format!(":{n}\r\n").as_bytes()),
            Out::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Out::Bulk(Some(bytes)) => {
                buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                buf.extend_from_slice(bytes);
                buf.extend_from_slice(b"\r\n");
            }
            Out::Array(items) => {
                buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }
}

/// Split an inline request into arguments, honouring double quotes
fn split_args(line: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            return Some(args);
        };
        let mut arg = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next()? {
                    '\\' => match chars.next()? {
                        'n' => arg.push('\n'),
                        'r' => arg.push('\r'),
                        't' => arg.push('\t'),
                        other => arg.push(other),
                    },
                    '"' => break,
                    c => arg.push(c),
                }
            }
            if chars.peek().is_some_and(|c| !c.is_whitespace()) {
                return None;
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => (0..=text.len()).any(|i| glob_match(&pattern[1..], &text[i..])),
        Some('?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some('\\') if pattern.len() > 1 => {
            text.first() == Some(&pattern[1]) && glob_match(&pattern[2..], &text[1..])
        }
        Some(c) => text.first() == Some(c) && glob_match(&pattern[1..], &text[1..]),
    }
}

fn execute(state: &mut State, args: &[String]) -> Out {
    let name = args[0].to_ascii_lowercase();
    let arity_error = || Out::Error(format!("ERR wrong number of arguments for '{name}' command"));
    match name.as_str() {
        "ping" => Out::Status("PONG"),
        "select" => match args.get(1).map(|db| db.parse::<u32>()) {
            Some(Ok(_)) => Out::ok(),
            _ => Out::Error("ERR invalid DB index".into()),
        },
        "set" if args.len() == 3 => {
            state.entries.insert(
                args[1].clone(),
                Entry {
                    value: Value::Text(args[2].as_bytes().to_vec()),
                    expires_at: None,
                },
            );
            Out::ok()
        }
        "append" if args.len() == 3 => match state.live(&args[1]) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => {
                text.extend_from_slice(args[2].as_bytes());
                Out::Integer(text.len() as i64)
            }
            Some(_) => Out::wrong_type(),
            None => {
                state.entries.insert(
                    args[1].clone(),
                    Entry {
                        value: Value::Text(args[2].as_bytes().to_vec()),
                        expires_at: None,
                    },
                );
                Out::Integer(args[2].len() as i64)
            }
        },
        "get" if args.len() == 2 => match state.live(&args[1]) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Out::Bulk(Some(text.clone())),
            Some(_) => Out::wrong_type(),
            None => Out::Bulk(None),
        },
        "hmset" if args.len() >= 4 && args.len() % 2 == 0 => {
            let pairs: Vec<(String, String)> = args[2..]
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            match state.live(&args[1]) {
                Some(Entry {
                    value: Value::Hash(fields),
                    ..
                }) => {
                    fields.extend(pairs);
                    Out::ok()
                }
                Some(_) => Out::wrong_type(),
                None => {
                    state.entries.insert(
                        args[1].clone(),
                        Entry {
                            value: Value::Hash(pairs.into_iter().collect()),
                            expires_at: None,
                        },
                    );
                    Out::ok()
                }
            }
        }
        "hgetall" if args.len() == 2 => match state.live(&args[1]) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Out::Array(
                fields
                    .iter()
                    .flat_map(|(field, value)| {
                        [
                            Out::Bulk(Some(field.as_bytes().to_vec())),
                            Out::Bulk(Some(value.as_bytes().to_vec())),
                        ]
                    })
                    .collect(),
            ),
            Some(_) => Out::wrong_type(),
            None => Out::Array(Vec::new()),
        },
        "expireat" if args.len() == 3 => {
            let Ok(at) = args[2].parse::<i64>() else {
                return Out::Error("ERR value is not an integer or out of range".into());
            };
            let key = args[1].clone();
            match state.live(&key) {
                Some(entry) => {
                    entry.expires_at = Some(at as f64);
                    state.purge_if_expired(&key);
                    Out::Integer(1)
                }
                None => Out::Integer(0),
            }
        }
        "ttl" if args.len() == 2 => match state.live(&args[1]) {
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => Out::Integer((*at - now()).round().max(0.0) as i64),
            Some(_) => Out::Integer(-1),
            None => Out::Integer(-2),
        },
        "del" if args.len() >= 2 => {
            let removed = args[1..]
                .iter()
                .filter(|key| state.live(key).is_some())
                .count();
            for key in &args[1..] {
                state.entries.remove(key);
            }
            Out::Integer(removed as i64)
        }
        "keys" if args.len() == 2 => {
            let pattern: Vec<char> = args[1].chars().collect();
            let names: Vec<String> = state.entries.keys().cloned().collect();
            let mut matching: Vec<String> = names
                .into_iter()
                .filter(|name| state.live(name).is_some())
                .filter(|name| glob_match(&pattern, &name.chars().collect::<Vec<_>>()))
                .collect();
            matching.sort();
            Out::Array(
                matching
                    .into_iter()
                    .map(|name| Out::Bulk(Some(name.into_bytes())))
                    .collect(),
            )
        }
        "set" | "append" | "get" | "hmset" | "hgetall" | "expireat" | "ttl" | "del" | "keys" => {
            arity_error()
        }
        _ => Out::Error(format!("ERR unknown command '{}'", args[0])),
    }
}

fn respond(state: &Mutex<State>, queued: &mut Option<Vec<Vec<String>>>, args: Vec<String>) -> Out {
    let name = args[0].to_ascii_lowercase();
    match name.as_str() {
        "multi" if queued.is_some() => Out::Error("ERR MULTI calls can not be nested".into()),
        "multi" => {
            *queued = Some(Vec::new());
            Out::ok()
        }
        "exec" => match queued.take() {
            Some(commands) => {
                let mut state = state.lock();
                Out::Array(
                    commands
                        .iter()
                        .map(|command| execute(&mut state, command))
                        .collect(),
                )
            }
            None => Out::Error("ERR EXEC without MULTI".into()),
        },
        "discard" => match queued.take() {
            Some(_) => Out::ok(),
            None => Out::Error("ERR DISCARD without MULTI".into()),
        },
        _ => match queued.as_mut() {
            Some(commands) => {
                commands.push(args);
                Out::Status("QUEUED")
            }
            None => execute(&mut state.lock(), &args),
        },
    }
}

fn write_reply(writer: &mut TcpStream, bytes: &[u8], split: Option<Duration>) -> std::io::Result<()> {
    match split {
        Some(pause) if bytes.len() >= 3 => {
            let cuts = [0, bytes.len() / 3, 2 * bytes.len() / 3, bytes.len()];
            for window in cuts.windows(2) {
                writer.write_all(&bytes[window[0]..window[1]])?;
                writer.flush()?;
                if window[1] < bytes.len() {
                    thread::sleep(pause);
                }
            }
            Ok(())
        }
        _ => {
            writer.write_all(bytes)?;
            writer.flush()
        }
    }
}

fn serve_connection(stream: TcpStream, state: Arc<Mutex<State>>) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut queued: Option<Vec<Vec<String>>> = None;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        let Some(args) = split_args(line) else {
            let reply = b"-ERR Protocol error: unbalanced quotes in request\r\n";
            if writer.write_all(reply).is_err() {
                return;
            }
            continue;
        };
        if args.is_empty() {
            continue;
        }

        let name = args[0].to_ascii_lowercase();
        let (fault, split) = {
            let mut state = state.lock();
            state.log.push(args.clone());
            (state.take_fault(&name), state.split)
        };
        let bytes = match fault {
            Some(Fault::Reply(raw)) => {
                if name == "exec" {
                    queued = None;
                }
                raw.into_bytes()
            }
            Some(Fault::Silence) => continue,
            Some(Fault::Hangup) => return,
            Some(Fault::Late(delay)) => {
                let mut bytes = Vec::new();
                respond(&state, &mut queued, args).encode(&mut bytes);
                thread::sleep(delay);
                bytes
            }
            None => {
                let mut bytes = Vec::new();
                respond(&state, &mut queued, args).encode(&mut bytes);
                bytes
            }
        };
        if write_reply(&mut writer, &bytes, split).is_err() {
            return;
        }
    }
}

/// A running fake server bound to a loopback port
pub struct FakeServer {
    port: u16,
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
}

impl FakeServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(State::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let accept_state = state.clone();
        let accept_stop = stop.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_stop.load(Ordering::SeqCst) {
                    break;
                }
                if let Ok(stream) = stream {
                    let state = accept_state.clone();
                    thread::spawn(move || serve_connection(stream, state));
                }
            }
        });

        Self { port, state, stop }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Settings pointing at this server with an empty prefix
    pub fn settings(&self) -> NetworkSettings {
        NetworkSettings::new()
            .with_endpoint("127.0.0.1", self.port)
            .with_prefix("")
            .with_timeout(Duration::from_secs(2))
    }

    /// Misbehave on every occurrence of `command`
    pub fn fail(&self, command: &str, fault: Fault) {
        self.fail_after(command, 0, fault);
    }

    /// Misbehave on `command` once its first `skip` occurrences went through
    pub fn fail_after(&self, command: &str, skip: usize, fault: Fault) {
        self.state
            .lock()
            .faults
            .insert(command.to_ascii_lowercase(), FaultRule { fault, skip });
    }

    /// Forget every fault
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.split = None;
    }

    /// Send every reply in three pieces with `pause` between them
    pub fn split_replies(&self, pause: Duration) {
        self.state.lock().split = Some(pause);
    }

    /// Every received command, as argument lists
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().log.clone()
    }

    /// Received commands named `name`
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|args| args[0].eq_ignore_ascii_case(name))
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.commands_named(name).len()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().live(key).is_some()
    }

    /// Live key names, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let names: Vec<String> = state.entries.keys().cloned().collect();
        let mut live: Vec<String> = names
            .into_iter()
            .filter(|name| state.live(name).is_some())
            .collect();
        live.sort();
        live
    }

    pub fn text(&self, key: &str) -> Option<Vec<u8>> {
        match self.state.lock().live(key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Some(text.clone()),
            _ => None,
        }
    }

    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        match self.state.lock().live(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => fields.get(field).cloned(),
            _ => None,
        }
    }

    pub fn expires_at(&self, key: &str) -> Option<f64> {
        self.state.lock().live(key).and_then(|entry| entry.expires_at)
    }

    pub fn insert_text(&self, key: &str, text: &[u8], ttl: Option<Duration>) {
        self.state.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(text.to_vec()),
                expires_at: ttl.map(|ttl| now() + ttl.as_secs_f64()),
            },
        );
    }

    pub fn insert_hash(&self, key: &str, fields: &[(&str, &str)], ttl: Option<Duration>) {
        self.state.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(
                    fields
                        .iter()
                        .map(|(f, v)| (f.to_string(), v.to_string()))
                        .collect(),
                ),
                expires_at: ttl.map(|ttl| now() + ttl.as_secs_f64()),
            },
        );
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

#[test]
fn fake_server_splits_quoted_arguments() {
    assert_eq!(
        split_args(r#"hmset k a "x y" b " " c "q\"\\""#).unwrap(),
        vec!["hmset", "k", "a", "x y", "b", " ", "c", "q\"\\"]
    );
    assert!(split_args(r#"set k "open"#).is_none());
    let pattern: Vec<char> = r"KeyValue:a\*:*".chars().collect();
    assert!(glob_match(&pattern, &"KeyValue:a*:k".chars().collect::<Vec<_>>()));
    assert!(!glob_match(&pattern, &"KeyValue:ab:k".chars().collect::<Vec<_>>()));
}
