use super::{DeleteOutcome, Object, ObjectStore, Precondition, Version, WriteOutcome};
use crate::error::StoreError;
use google_cloud_spanner::client::Client;
use google_cloud_spanner::client::ClientConfig;
use google_cloud_spanner::client::Error;
use google_cloud_spanner::statement::Statement;
use google_cloud_spanner::transaction_rw::ReadWriteTransaction;
use log::*;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::mpsc;
use std::sync::mpsc::{Receiver, Sender};
use std::thread;
use std::time::Instant;
use tokio::runtime::Runtime;

/// Default table name. Expected schema:
///
/// ```sql
/// CREATE TABLE storelock_objects (
///   name STRING(MAX) NOT NULL,
///   body BYTES(MAX) NOT NULL,
///   version INT64 NOT NULL,
///   updated TIMESTAMP OPTIONS (allow_commit_timestamp=true),
/// ) PRIMARY KEY (name)
/// ```
pub const DEFAULT_TABLE: &str = "storelock_objects";

type Reply<T> = Sender<Result<T, StoreError>>;

#[derive(Debug)]
enum ProtoCtrl {
    Exit,
    Get {
        key: String,
        reply: Reply<Option<Object>>,
    },
    Put {
        key: String,
        body: Vec<u8>,
        cond: Precondition,
        reply: Reply<WriteOutcome>,
    },
    Delete {
        key: String,
        expected: Option<Version>,
        reply: Reply<DeleteOutcome>,
    },
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_version(v: &Version) -> Result<i64, StoreError> {
    v.as_str()
        .parse::<i64>()
        .map_err(|_| StoreError::Backend(format!("foreign version token '{v}'")))
}

async fn get_object(client: &Client, table: &str, key: &str) -> Result<Option<Object>, StoreError> {
    let mut q = String::new();
    write!(&mut q, "select body, version from {} ", table).map_err(backend)?;
    write!(&mut q, "where name = @name").map_err(backend)?;
    let mut stmt = Statement::new(q);
    stmt.add_param("name", &key.to_string());
    let mut tx = client.single().await.map_err(backend)?;
    let mut iter = tx.query(stmt).await.map_err(backend)?;
    if let Some(row) = iter.next().await.map_err(backend)? {
        let body = row.column_by_name::<Vec<u8>>("body").map_err(backend)?;
        let version = row.column_by_name::<i64>("version").map_err(backend)?;
        return Ok(Some(Object {
            body,
            version: Version::new(version.to_string()),
        }));
    }

    Ok(None)
}

async fn exists(tx: &mut ReadWriteTransaction, table: &str, key: &str) -> Result<bool, Error> {
    let mut stmt = Statement::new(format!("select 1 from {} where name = @name", table));
    stmt.add_param("name", &key.to_string());
    let mut iter = tx.query(stmt).await?;
    Ok(iter.next().await?.is_some())
}

enum TxWrite {
    Written(i64),
    Overwritten,
    Rejected,
}

async fn put_in_tx(
    tx: &mut ReadWriteTransaction,
    table: &str,
    key: &str,
    body: &[u8],
    cond: &Precondition,
    expected: Option<i64>,
) -> Result<TxWrite, Error> {
    let body = body.to_vec();
    if let (Precondition::IfMatch(_), Some(expected)) = (cond, expected) {
        let mut q = String::new();
        q.push_str(&format!("update {} ", table));
        q.push_str("set body = @body, version = version + 1, ");
        q.push_str("updated = PENDING_COMMIT_TIMESTAMP() ");
        q.push_str("where name = @name and version = @version");
        let mut stmt = Statement::new(q);
        stmt.add_param("name", &key.to_string());
        stmt.add_param("body", &body);
        stmt.add_param("version", &expected);
        let n = tx.update(stmt).await?;
        return Ok(if n == 1 {
            TxWrite::Written(expected + 1)
        } else {
            TxWrite::Rejected
        });
    }

    if exists(tx, table, key).await? {
        if *cond != Precondition::None {
            return Ok(TxWrite::Rejected);
        }

        let mut q = String::new();
        q.push_str(&format!("update {} ", table));
        q.push_str("set body = @body, version = version + 1, ");
        q.push_str("updated = PENDING_COMMIT_TIMESTAMP() ");
        q.push_str("where name = @name");
        let mut stmt = Statement::new(q);
        stmt.add_param("name", &key.to_string());
        stmt.add_param("body", &body);
        tx.update(stmt).await?;
        return Ok(TxWrite::Overwritten);
    }

    let mut q = String::new();
    q.push_str(&format!("insert into {} ", table));
    q.push_str("(name, body, version, updated) ");
    q.push_str("values (@name, @body, 1, PENDING_COMMIT_TIMESTAMP())");
    let mut stmt = Statement::new(q);
    stmt.add_param("name", &key.to_string());
    stmt.add_param("body", &body);
    tx.update(stmt).await?;
    Ok(TxWrite::Written(1))
}

async fn delete_in_tx(
    tx: &mut ReadWriteTransaction,
    table: &str,
    key: &str,
    expected: Option<i64>,
) -> Result<DeleteOutcome, Error> {
    let mut q = format!("delete from {} where name = @name", table);
    if expected.is_some() {
        q.push_str(" and version = @version");
    }

    let mut stmt = Statement::new(q);
    stmt.add_param("name", &key.to_string());
    if let Some(v) = expected {
        stmt.add_param("version", &v);
    }

    if tx.update(stmt).await? == 1 {
        return Ok(DeleteOutcome::Deleted);
    }

    // Nothing deleted: either the row is gone or its version moved on.
    if expected.is_some() && exists(tx, table, key).await? {
        Ok(DeleteOutcome::PreconditionFailed)
    } else {
        Ok(DeleteOutcome::Missing)
    }
}

async fn put_object(
    client: &Client,
    table: &str,
    key: &str,
    body: &[u8],
    cond: &Precondition,
) -> Result<WriteOutcome, StoreError> {
    let expected = match cond {
        Precondition::IfMatch(v) => Some(parse_version(v)?),
        _ => None,
    };

    let mut tx = client.begin_read_write_transaction().await.map_err(backend)?;
    let res = put_in_tx(&mut tx, table, key, body, cond, expected).await;
    let res = tx.end(res, None).await;
    match res {
        Ok((_, TxWrite::Written(v))) => Ok(WriteOutcome::Written(Version::new(v.to_string()))),
        Ok((_, TxWrite::Rejected)) => Ok(WriteOutcome::PreconditionFailed),
        Ok((_, TxWrite::Overwritten)) => {
            // The new version is only known after commit.
            let current = get_object(client, table, key).await?;
            let version = current.map(|o| o.version).unwrap_or_else(|| Version::new("0"));
            Ok(WriteOutcome::Written(version))
        }
        Err(e) => Err(backend(e)),
    }
}

async fn delete_object(
    client: &Client,
    table: &str,
    key: &str,
    expected: Option<&Version>,
) -> Result<DeleteOutcome, StoreError> {
    let expected = expected.map(parse_version).transpose()?;
    let mut tx = client.begin_read_write_transaction().await.map_err(backend)?;
    let res = delete_in_tx(&mut tx, table, key, expected).await;
    let res = tx.end(res, None).await;
    res.map(|(_, out)| out).map_err(backend)
}

fn spanner_caller(
    db: String,
    table: String,
    rx_ctrl: Receiver<ProtoCtrl>,
    tx_ready: Sender<Result<(), StoreError>>,
) {
    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = tx_ready.send(Err(e.into()));
            return;
        }
    };

    let client = rt.block_on(async {
        let config = ClientConfig::default().with_auth().await.map_err(backend)?;
        Client::new(db, config).await.map_err(backend)
    });

    let client = match client {
        Ok(c) => {
            let _ = tx_ready.send(Ok(()));
            c
        }
        Err(e) => {
            let _ = tx_ready.send(Err(e));
            return;
        }
    };

    for code in rx_ctrl {
        let start = Instant::now();
        match code {
            ProtoCtrl::Exit => {
                rt.block_on(async { client.close().await });
                return;
            }
            ProtoCtrl::Get { key, reply } => {
                let res = rt.block_on(get_object(&client, &table, &key));
                let _ = reply.send(res);
                debug!("ProtoCtrl::Get({key}) took {:?}", start.elapsed());
            }
            ProtoCtrl::Put {
                key,
                body,
                cond,
                reply,
            } => {
                let res = rt.block_on(put_object(&client, &table, &key, &body, &cond));
                let _ = reply.send(res);
                debug!("ProtoCtrl::Put({key}) took {:?}", start.elapsed());
            }
            ProtoCtrl::Delete {
                key,
                expected,
                reply,
            } => {
                let res = rt.block_on(delete_object(&client, &table, &key, expected.as_ref()));
                let _ = reply.send(res);
                debug!("ProtoCtrl::Delete({key}) took {:?}", start.elapsed());
            }
        }
    }

    // All senders dropped without an explicit exit.
    rt.block_on(async { client.close().await });
}

/// Object store backed by a Cloud Spanner table.
///
/// Spanner calls are delegated to a dedicated thread that owns a tokio
/// runtime and the client, so callers keep a plain blocking API.
pub struct SpannerStore {
    table: String,
    tx_ctrl: Mutex<Sender<ProtoCtrl>>,
}

impl SpannerStore {
    /// Connects to `db` (`projects/<p>/instances/<i>/databases/<d>`) and
    /// blocks until the client is ready.
    pub fn connect(db: String, table: String) -> Result<Self, StoreError> {
        info!("db={db}, table={table}");
        let (tx_ctrl, rx_ctrl): (Sender<ProtoCtrl>, Receiver<ProtoCtrl>) = mpsc::channel();
        let (tx_ready, rx_ready) = mpsc::channel();
        let tbl = table.clone();
        thread::Builder::new()
            .name("storelock-spanner".to_string())
            .spawn(move || spanner_caller(db, tbl, rx_ctrl, tx_ready))?;

        rx_ready.recv().map_err(|_| StoreError::Closed)??;
        Ok(SpannerStore {
            table,
            tx_ctrl: Mutex::new(tx_ctrl),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> ProtoCtrl) -> Result<T, StoreError> {
        let (tx, rx) = mpsc::channel();
        {
            let sender = self.tx_ctrl.lock().map_err(|_| StoreError::Closed)?;
            sender.send(make(tx)).map_err(|_| StoreError::Closed)?;
        }

        rx.recv().map_err(|_| StoreError::Closed)?
    }
}

impl ObjectStore for SpannerStore {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError> {
        self.call(|reply| ProtoCtrl::Get {
            key: key.to_string(),
            reply,
        })
    }

    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        cond: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        self.call(|reply| ProtoCtrl::Put {
            key: key.to_string(),
            body,
            cond,
            reply,
        })
    }

    fn delete(&self, key: &str, expected: Option<&Version>) -> Result<DeleteOutcome, StoreError> {
        self.call(|reply| ProtoCtrl::Delete {
            key: key.to_string(),
            expected: expected.cloned(),
            reply,
        })
    }
}

impl Drop for SpannerStore {
    fn drop(&mut self) {
        if let Ok(sender) = self.tx_ctrl.lock() {
            if let Err(e) = sender.send(ProtoCtrl::Exit) {
                error!("ProtoCtrl::Exit failed: {e}");
            }
        }
    }
}
