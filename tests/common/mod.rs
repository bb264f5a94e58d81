//! Scripted in-process backend shared by the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use sqlclient::config::ClientSettings;
use sqlclient::db::backend::{self, BackendFactory, BINARY_MARKER};
use sqlclient::db::{Backend, BackendNotification, Client, RowSink, Statement, governor};
use sqlclient::error::{SqlError, SqlResult};
use sqlclient::models::{FieldNames, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything the fake backend saw, plus knobs to script its behaviour.
#[derive(Debug, Default)]
pub struct FakeLog {
    /// Statements made durable (autocommitted or committed).
    pub committed: Vec<String>,
    /// Statements run inside the open transaction.
    pub pending: Vec<String>,
    /// Every statement that ran successfully, rolled back or not.
    pub executed: Vec<String>,
    pub queries: Vec<String>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub in_transaction: bool,
    /// Statements or queries containing one of these fail with a statement error.
    pub fail_on: Vec<String>,
    /// Statements containing one of these fail with a connection error.
    pub drop_on: Vec<String>,
    pub fail_connect: bool,
    pub listening: Vec<String>,
    pub inbox: Vec<BackendNotification>,
    /// Default query result: one row `n` holding the number of queries run.
    pub query_counter: i64,
    pub query_delay: Option<Duration>,
    /// Fixed results for exact query texts.
    pub scripted: HashMap<String, (Vec<String>, Vec<Vec<Value>>)>,
}

pub type SharedLog = Arc<Mutex<FakeLog>>;

impl FakeLog {
    pub fn shared() -> SharedLog {
        Arc::new(Mutex::new(FakeLog::default()))
    }
}

pub fn script(log: &SharedLog, sql: &str, fields: &[&str], rows: Vec<Vec<Value>>) {
    log.lock().scripted.insert(
        sql.to_string(),
        (fields.iter().map(|f| f.to_string()).collect(), rows),
    );
}

pub struct FakeBackend {
    log: SharedLog,
    connected: bool,
}

impl FakeBackend {
    pub fn new(log: SharedLog) -> Self {
        Self {
            log,
            connected: false,
        }
    }

    fn check_connected(&self) -> SqlResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(SqlError::connection("fake backend not connected", "connect first"))
        }
    }
}

impl Backend for FakeBackend {
    fn connect(&mut self, _settings: &ClientSettings) -> SqlResult<()> {
        let mut log = self.log.lock();
        log.connects += 1;
        if log.fail_connect {
            return Err(SqlError::connection("fake server unreachable", "start it"));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            let mut log = self.log.lock();
            log.disconnects += 1;
            log.pending.clear();
            log.in_transaction = false;
            log.listening.clear();
        }
    }

    fn execute(&mut self, statement: &Statement) -> SqlResult<i64> {
        self.check_connected()?;
        let bytes = backend::insert_blobs(
            &*self,
            statement.text.as_bytes(),
            BINARY_MARKER,
            &statement.blobs,
        )?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let mut log = self.log.lock();
        if log.drop_on.iter().any(|s| text.contains(s.as_str())) {
            return Err(SqlError::connection("fake connection dropped", "reconnect"));
        }
        if log.fail_on.iter().any(|s| text.contains(s.as_str())) {
            return Err(SqlError::statement("forced failure", ""));
        }
        log.executed.push(text.clone());
        if log.in_transaction {
            log.pending.push(text);
        } else {
            log.committed.push(text);
        }
        Ok(1)
    }

    fn query(&mut self, sql: &str, sink: &mut dyn RowSink) -> SqlResult<()> {
        self.check_connected()?;
        let delay = self.log.lock().query_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let (fields, rows) = {
            let mut log = self.log.lock();
            log.queries.push(sql.to_string());
            if log.fail_on.iter().any(|s| sql.contains(s.as_str())) {
                return Err(SqlError::statement("forced failure", ""));
            }
            match log.scripted.get(sql) {
                Some((fields, rows)) => (fields.clone(), rows.clone()),
                None => {
                    log.query_counter += 1;
                    (
                        vec!["n".to_string()],
                        vec![vec![Value::Integer(log.query_counter)]],
                    )
                }
            }
        };
        let fields = Arc::new(FieldNames::new(fields)?);
        sink.reserve(rows.len());
        for row in rows {
            sink.row(&fields, row)?;
        }
        Ok(())
    }

    fn length_of_escaped_binary(&self, blob: &[u8]) -> usize {
        3 + 2 * blob.len()
    }

    fn copy_escaped_binary(&self, blob: &[u8], out: &mut Vec<u8>) -> usize {
        out.extend_from_slice(b"x'");
        for byte in blob {
            out.extend_from_slice(format!("{:02x}", byte).as_bytes());
        }
        out.push(b'\'');
        self.length_of_escaped_binary(blob)
    }

    fn begin(&mut self) -> SqlResult<()> {
        self.check_connected()?;
        let mut log = self.log.lock();
        log.begins += 1;
        log.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> SqlResult<()> {
        self.check_connected()?;
        let mut log = self.log.lock();
        log.commits += 1;
        let pending = std::mem::take(&mut log.pending);
        log.committed.extend(pending);
        log.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> SqlResult<()> {
        self.check_connected()?;
        let mut log = self.log.lock();
        log.rollbacks += 1;
        log.pending.clear();
        log.in_transaction = false;
        Ok(())
    }

    fn listen(&mut self, name: &str) -> SqlResult<()> {
        let mut log = self.log.lock();
        if !log.listening.iter().any(|n| n == name) {
            log.listening.push(name.to_string());
        }
        Ok(())
    }

    fn unlisten(&mut self, name: &str) -> SqlResult<()> {
        self.log.lock().listening.retain(|n| n != name);
        Ok(())
    }

    fn notify(&mut self, name: &str, payload: Option<&str>) -> SqlResult<()> {
        self.check_connected()?;
        let mut log = self.log.lock();
        if log.listening.iter().any(|n| n == name) {
            log.inbox.push(BackendNotification {
                name: name.to_string(),
                payload: payload.map(str::to_string),
                local: true,
            });
        }
        Ok(())
    }

    fn take_notifications(&mut self) -> Vec<BackendNotification> {
        std::mem::take(&mut self.log.lock().inbox)
    }
}

/// Keep the process-wide ceiling out of the way of unrelated tests.
pub fn setup() {
    governor::set_max_connections(1000);
}

pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

pub fn settings(database: &str) -> ClientSettings {
    ClientSettings::new(database, "tester", "Fake")
}

/// A registered client over a fresh fake backend.
pub fn fake_client(prefix: &str) -> (Arc<Client>, SharedLog) {
    fake_client_with(&unique_name(prefix), settings("fake_db"))
}

pub fn fake_client_with(name: &str, settings: ClientSettings) -> (Arc<Client>, SharedLog) {
    setup();
    let log = FakeLog::shared();
    let client = Client::with_backend(name, settings, Box::new(FakeBackend::new(Arc::clone(&log))))
        .expect("client");
    (client, log)
}

/// Backend factory whose backends all record into `log`.
pub fn fake_factory(log: &SharedLog) -> BackendFactory {
    let log = Arc::clone(log);
    Arc::new(move |_settings: &ClientSettings| {
        Ok(Box::new(FakeBackend::new(Arc::clone(&log))) as Box<dyn Backend>)
    })
}
