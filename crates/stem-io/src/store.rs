//! SQLite run store: samples, set memberships, and every generated set.
//!
//! The store is written by a single writer after training has finished,
//! one transaction per table, and read back by `stem map`.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{Connection, TransactionBehavior, params, params_from_iter};
use stem_ensemble::{Bounds, Membership, SampleTable, SetId, SetStatus};
use tracing::{debug, info, instrument};

use crate::IoError;
use crate::records::SetRecord;

const IMPORTANCE_PREFIX: &str = "importance_";

/// Fixed leading columns of `support_sets`, in order.
const SET_COLUMNS: [&str; 15] = [
    "set_id",
    "status",
    "ul_x",
    "ul_y",
    "lr_x",
    "lr_y",
    "min_obs",
    "max_features",
    "n_samples",
    "n_train",
    "n_oob",
    "dt_file",
    "oob_rate",
    "oob_count",
    "message",
];

/// Set rows read back from a store, with the predictor order of their
/// importance columns.
#[derive(Debug, Clone)]
pub struct StoredSets {
    /// Predictor names, in importance order.
    pub predictor_names: Vec<String>,
    /// Rows ascending by set id.
    pub records: Vec<SetRecord>,
}

/// Handle on a run's SQLite file.
pub struct RunStore {
    path: PathBuf,
    conn: Connection,
}

impl RunStore {
    /// Create (or reset) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Store`] if the file cannot be opened or initialized.
    pub fn create(path: &Path) -> Result<Self, IoError> {
        let store = Self::connect(path)?;
        store
            .conn
            .execute_batch(
                "DROP TABLE IF EXISTS run_info;
                 DROP TABLE IF EXISTS train_sample;
                 DROP TABLE IF EXISTS set_samples;
                 DROP TABLE IF EXISTS support_sets;
                 CREATE TABLE run_info (key TEXT PRIMARY KEY, value TEXT NOT NULL);
                 CREATE TABLE set_samples (
                    set_id INTEGER NOT NULL,
                    sample_id INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    PRIMARY KEY (set_id, sample_id)
                 );",
            )
            .map_err(|e| store_err(path, e))?;
        debug!(path = %path.display(), "created run store");
        Ok(store)
    }

    /// Open an existing store.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::FileNotFound`] | no store at `path` |
    /// | [`IoError::Store`] | the file cannot be opened |
    pub fn open(path: &Path) -> Result<Self, IoError> {
        std::fs::metadata(path).map_err(|e| IoError::FileNotFound {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::connect(path)
    }

    fn connect(path: &Path) -> Result<Self, IoError> {
        let conn = Connection::open(path).map_err(|e| store_err(path, e))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| store_err(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Path of the SQLite file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record run-level key/value metadata.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Store`] on any SQLite failure.
    pub fn write_run_info(&mut self, entries: &[(&str, String)]) -> Result<(), IoError> {
        let path = self.path.clone();
        let err = |e| store_err(&path, e);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO run_info (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .map_err(err)?;
            for (key, value) in entries {
                stmt.execute(params![key, value]).map_err(err)?;
            }
        }
        tx.commit().map_err(err)
    }

    /// Look up one run-level value.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Store`] on any SQLite failure.
    pub fn run_info(&self, key: &str) -> Result<Option<String>, IoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM run_info WHERE key = ?1")
            .map_err(|e| store_err(&self.path, e))?;
        let mut rows = stmt.query(params![key]).map_err(|e| store_err(&self.path, e))?;
        match rows.next().map_err(|e| store_err(&self.path, e))? {
            Some(row) => Ok(Some(row.get(0).map_err(|e| store_err(&self.path, e))?)),
            None => Ok(None),
        }
    }

    /// Write the training samples as `train_sample`.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Store`] on any SQLite failure.
    #[instrument(skip_all, fields(n_samples = table.len()))]
    pub fn write_samples(&mut self, table: &SampleTable) -> Result<(), IoError> {
        let path = self.path.clone();
        let err = |e| store_err(&path, e);
        let value_cols: Vec<String> = std::iter::once(table.target_name())
            .chain(table.predictor_names().iter().map(String::as_str))
            .map(quote_ident)
            .collect();
        let create = format!(
            "DROP TABLE IF EXISTS train_sample;
             CREATE TABLE train_sample (sample_id INTEGER PRIMARY KEY, x REAL NOT NULL, y REAL NOT NULL, {})",
            value_cols
                .iter()
                .map(|c| format!("{c} REAL"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let insert = format!(
            "INSERT INTO train_sample (sample_id, x, y, {}) VALUES ({})",
            value_cols.join(", "),
            placeholders(3 + value_cols.len())
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;
        tx.execute_batch(&create).map_err(err)?;
        {
            let mut stmt = tx.prepare(&insert).map_err(err)?;
            for s in table.samples() {
                let row = [Value::Integer(s.id.get() as i64), Value::Real(s.x), Value::Real(s.y)]
                    .into_iter()
                    .chain(std::iter::once(Value::Real(s.target)))
                    .chain(s.predictors.iter().map(|&v| Value::Real(v)));
                stmt.execute(params_from_iter(row)).map_err(err)?;
            }
        }
        tx.commit().map_err(err)?;
        debug!("wrote train_sample");
        Ok(())
    }

    /// Write per-set sample roles as `set_samples`.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Store`] on any SQLite failure.
    #[instrument(skip_all, fields(n_rows = rows.len()))]
    pub fn write_memberships(&mut self, rows: &[Membership]) -> Result<(), IoError> {
        let path = self.path.clone();
        let err = |e| store_err(&path, e);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO set_samples (set_id, sample_id, role) VALUES (?1, ?2, ?3)")
                .map_err(err)?;
            for m in rows {
                stmt.execute(params![m.set_id.get() as i64, m.sample_id.get() as i64, m.role.as_str()])
                    .map_err(err)?;
            }
        }
        tx.commit().map_err(err)?;
        debug!("wrote set_samples");
        Ok(())
    }

    /// Write every generated set as `support_sets`, replacing earlier rows.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Store`] on any SQLite failure.
    #[instrument(skip_all, fields(n_sets = records.len()))]
    pub fn write_sets(&mut self, records: &[SetRecord], predictor_names: &[String]) -> Result<(), IoError> {
        let path = self.path.clone();
        let err = |e| store_err(&path, e);
        let importance_cols: Vec<String> = predictor_names
            .iter()
            .map(|p| quote_ident(&format!("{IMPORTANCE_PREFIX}{p}")))
            .collect();
        let mut columns_sql = String::from(
            "set_id INTEGER PRIMARY KEY, status TEXT NOT NULL,
             ul_x REAL NOT NULL, ul_y REAL NOT NULL, lr_x REAL NOT NULL, lr_y REAL NOT NULL,
             min_obs INTEGER NOT NULL, max_features INTEGER, n_samples INTEGER NOT NULL,
             n_train INTEGER, n_oob INTEGER, dt_file TEXT, oob_rate REAL, oob_count INTEGER, message TEXT",
        );
        for col in &importance_cols {
            columns_sql.push_str(&format!(", {col} REAL"));
        }
        let create = format!(
            "DROP TABLE IF EXISTS support_sets;
             CREATE TABLE support_sets ({columns_sql})"
        );
        let all_cols: Vec<String> = SET_COLUMNS
            .iter()
            .map(|c| (*c).to_string())
            .chain(importance_cols.iter().cloned())
            .collect();
        let insert = format!(
            "INSERT INTO support_sets ({}) VALUES ({})",
            all_cols.join(", "),
            placeholders(all_cols.len())
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;
        tx.execute_batch(&create).map_err(err)?;
        {
            let mut stmt = tx.prepare(&insert).map_err(err)?;
            for r in records {
                let int = |v: Option<usize>| v.map_or(Value::Null, |n| Value::Integer(n as i64));
                let mut row = vec![
                    Value::Integer(r.set_id.get() as i64),
                    Value::Text(r.status.as_str().to_string()),
                    Value::Real(r.bounds.min_x),
                    Value::Real(r.bounds.max_y),
                    Value::Real(r.bounds.max_x),
                    Value::Real(r.bounds.min_y),
                    Value::Integer(r.min_obs as i64),
                    int(r.max_features),
                    Value::Integer(r.n_samples as i64),
                    int(r.n_train),
                    int(r.n_oob),
                    r.dt_file.clone().map_or(Value::Null, Value::Text),
                    r.oob_rate.map_or(Value::Null, Value::Real),
                    int(r.oob_count),
                    r.message.clone().map_or(Value::Null, Value::Text),
                ];
                row.extend(
                    (0..predictor_names.len())
                        .map(|i| r.importances.get(i).map_or(Value::Null, |&v| Value::Real(v))),
                );
                stmt.execute(params_from_iter(row)).map_err(err)?;
            }
        }
        tx.commit().map_err(err)?;
        info!(path = %self.path.display(), "wrote support_sets");
        Ok(())
    }

    /// Read set rows back, optionally only those with `status`.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`IoError::Store`] | SQLite failure or missing table/column |
    /// | [`IoError::StoreContent`] | unknown status or negative count |
    pub fn load_sets(&self, status: Option<SetStatus>) -> Result<StoredSets, IoError> {
        let err = |e| store_err(&self.path, e);
        let sql = match status {
            Some(_) => "SELECT * FROM support_sets WHERE status = ?1 ORDER BY set_id",
            None => "SELECT * FROM support_sets ORDER BY set_id",
        };
        let mut stmt = self.conn.prepare(sql).map_err(err)?;

        let mut idx = [0usize; SET_COLUMNS.len()];
        for (slot, name) in idx.iter_mut().zip(SET_COLUMNS) {
            *slot = stmt.column_index(name).map_err(err)?;
        }
        let importance: Vec<(usize, String)> = stmt
            .column_names()
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                name.strip_prefix(IMPORTANCE_PREFIX)
                    .map(|p| (i, p.to_string()))
            })
            .collect();

        let mut rows = match status {
            Some(s) => stmt.query(params![s.as_str()]),
            None => stmt.query([]),
        }
        .map_err(err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(err)? {
            let count = |i: usize| -> Result<Option<usize>, IoError> {
                let v: Option<i64> = row.get(idx[i]).map_err(err)?;
                v.map(|n| {
                    usize::try_from(n).map_err(|_| IoError::StoreContent {
                        path: self.path.clone(),
                        message: format!("negative {} {n}", SET_COLUMNS[i]),
                    })
                })
                .transpose()
            };
            let real = |i: usize| -> Result<Option<f64>, IoError> { row.get(idx[i]).map_err(err) };
            let text = |i: usize| -> Result<Option<String>, IoError> { row.get(idx[i]).map_err(err) };

            let set_id: i64 = row.get(idx[0]).map_err(err)?;
            let status_text = text(1)?.unwrap_or_default();
            let status = status_text.parse().map_err(|message| IoError::StoreContent {
                path: self.path.clone(),
                message,
            })?;
            let corner = |i: usize| -> Result<f64, IoError> { Ok(real(i)?.unwrap_or(f64::NAN)) };
            let importances = importance
                .iter()
                .map(|(i, _)| -> Result<f64, IoError> {
                    let v: Option<f64> = row.get(*i).map_err(err)?;
                    Ok(v.unwrap_or(f64::NAN))
                })
                .collect::<Result<Vec<_>, _>>()?;

            records.push(SetRecord {
                set_id: SetId::new(set_id as u64),
                status,
                bounds: Bounds::from_corners(corner(2)?, corner(3)?, corner(4)?, corner(5)?),
                min_obs: count(6)?.unwrap_or(0),
                max_features: count(7)?,
                n_samples: count(8)?.unwrap_or(0),
                n_train: count(9)?,
                n_oob: count(10)?,
                dt_file: text(11)?,
                oob_rate: real(12)?,
                oob_count: count(13)?,
                importances: if matches!(status, SetStatus::Insufficient | SetStatus::Failed) {
                    Vec::new()
                } else {
                    importances
                },
                message: text(14)?,
            });
        }
        debug!(n_sets = records.len(), "loaded support sets");
        Ok(StoredSets {
            predictor_names: importance.into_iter().map(|(_, name)| name).collect(),
            records,
        })
    }
}

fn store_err(path: &Path, e: rusqlite::Error) -> IoError {
    IoError::Store {
        path: path.to_path_buf(),
        source: e,
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}
