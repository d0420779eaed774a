//! Building many tables against one [`Db`].

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::thread;

use asupersync::Cx;

use rowmap_core::{ConfigError, Connection, Error, Record, Result};

use crate::db::Db;
use crate::table::Table;

type BoundTable = Box<dyn Any + Send + Sync>;
type BindJob<C> = Box<dyn FnOnce(Arc<Db<C>>) -> Result<BoundTable> + Send>;
type ExistsCheck =
    for<'a> fn(&'a BoundTable, &'a Cx) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

struct Registration<C: Connection> {
    name: String,
    build: BindJob<C>,
    exists: ExistsCheck,
}

/// Collects table registrations and constructs them together.
///
/// A failure binding one table is recorded under its name and never affects
/// the others. A name registered twice binds neither registration. When the
/// `Db` checks table existence, every constructed table is checked before it
/// is handed out.
///
/// ```ignore
/// let mut bound = TableBinder::new(db.clone())
///     .add::<User>("users")
///     .add::<Order>("orders")
///     .bind_parallel(&cx, 4)
///     .await;
/// assert!(bound.errors().is_empty());
/// let users: Table<User, _> = bound.take("users").unwrap();
/// ```
pub struct TableBinder<C: Connection + 'static> {
    db: Arc<Db<C>>,
    jobs: Vec<Registration<C>>,
}

fn check_exists<'a, R: Record + Default, C: Connection + 'static>(
    table: &'a BoundTable,
    cx: &'a Cx,
) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        match table.downcast_ref::<Table<R, C>>() {
            Some(table) => table.check_exists(cx).await,
            None => Ok(()),
        }
    })
}

impl<C: Connection + 'static> TableBinder<C> {
    pub fn new(db: Arc<Db<C>>) -> Self {
        Self {
            db,
            jobs: Vec::new(),
        }
    }

    pub fn add<R: Record + Default>(mut self, table: &str) -> Self {
        let name = table.to_string();
        let build: BindJob<C> = Box::new(move |db| {
            Table::<R, C>::new(db, &name).map(|table| Box::new(table) as BoundTable)
        });
        self.jobs.push(Registration {
            name: table.to_string(),
            build,
            exists: check_exists::<R, C>,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Bind every table on the calling thread, in registration order.
    pub async fn bind(self, cx: &Cx) -> BoundTables {
        let (jobs, mut bound) = split_duplicates(self.jobs);
        let mut built = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = (job.build)(Arc::clone(&self.db));
            built.push((job.name, job.exists, result));
        }
        check_built(&self.db, cx, built, &mut bound).await;
        bound.log();
        bound
    }

    /// Construct tables on scoped worker threads, one per table and at most
    /// `max_workers` at a time, then check their existence on the calling
    /// task. A panicking worker is reported as a configuration fault for its
    /// table.
    pub async fn bind_parallel(self, cx: &Cx, max_workers: usize) -> BoundTables {
        let workers = NonZeroUsize::new(max_workers)
            .or_else(|| thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get);
        let (jobs, mut bound) = split_duplicates(self.jobs);
        let mut built = Vec::with_capacity(jobs.len());
        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            let batch: Vec<_> = jobs.by_ref().take(workers).collect();
            let results: Vec<_> = thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .into_iter()
                    .map(|job| {
                        let db = Arc::clone(&self.db);
                        let build = job.build;
                        (job.name, job.exists, scope.spawn(move || build(db)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(name, exists, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(ConfigError::BindPanicked {
                                table: name.clone(),
                            }
                            .into())
                        });
                        (name, exists, result)
                    })
                    .collect()
            });
            built.extend(results);
        }
        check_built(&self.db, cx, built, &mut bound).await;
        bound.log();
        bound
    }
}

/// Drop every registration whose name is used more than once, recording a
/// configuration fault under that name.
fn split_duplicates<C: Connection>(
    jobs: Vec<Registration<C>>,
) -> (Vec<Registration<C>>, BoundTables) {
    let mut uses: HashMap<String, usize> = HashMap::new();
    for job in &jobs {
        *uses.entry(job.name.clone()).or_default() += 1;
    }
    let mut bound = BoundTables::default();
    let mut unique = Vec::with_capacity(jobs.len());
    for job in jobs {
        let count = uses.get(&job.name).copied().unwrap_or(0);
        if count > 1 {
            if !bound.errors.contains_key(&job.name) {
                let error = ConfigError::DuplicateTable {
                    table: job.name.clone(),
                    count,
                };
                bound.record(job.name, Err(error.into()));
            }
        } else {
            unique.push(job);
        }
    }
    (unique, bound)
}

async fn check_built<C: Connection>(
    db: &Db<C>,
    cx: &Cx,
    built: Vec<(String, ExistsCheck, Result<BoundTable>)>,
    bound: &mut BoundTables,
) {
    let check_tables = db.config().check_table_existence;
    for (name, exists, result) in built {
        let result = match result {
            Ok(table) if check_tables => exists(&table, cx).await.map(|()| table),
            other => other,
        };
        bound.record(name, result);
    }
}

/// Tables produced by a [`TableBinder`], plus the errors of those that
/// failed.
#[derive(Default)]
pub struct BoundTables {
    tables: HashMap<String, BoundTable>,
    errors: HashMap<String, Error>,
}

impl BoundTables {
    fn record(&mut self, name: String, result: Result<BoundTable>) {
        match result {
            Ok(table) => {
                self.tables.insert(name, table);
            }
            Err(error) => {
                self.errors.insert(name, error);
            }
        }
    }

    fn log(&self) {
        if self.errors.is_empty() {
            tracing::info!(tables = self.tables.len(), "tables bound");
        } else {
            for (table, error) in &self.errors {
                tracing::warn!(table = %table, %error, "table binding failed");
            }
            tracing::info!(
                tables = self.tables.len(),
                failed = self.errors.len(),
                "tables bound with failures"
            );
        }
    }

    /// Remove and return the table bound under `name`, if it was bound with
    /// record type `R`.
    pub fn take<R: Record, C: Connection + 'static>(&mut self, name: &str) -> Option<Table<R, C>> {
        let table = self.tables.remove(name)?;
        match table.downcast::<Table<R, C>>() {
            Ok(table) => Some(*table),
            Err(table) => {
                self.tables.insert(name.to_string(), table);
                None
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn errors(&self) -> &HashMap<String, Error> {
        &self.errors
    }

    pub fn error(&self, name: &str) -> Option<&Error> {
        self.errors.get(name)
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Debug for BoundTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTables")
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .field("errors", &self.errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;
    use crate::config::DbConfig;
    use crate::mock::MockConnection;
    use asupersync::runtime::RuntimeBuilder;
    use rowmap_core::ErrorKind;

    #[derive(Debug, Default, Clone, Record)]
    pub struct Good {
        pub id: i64,
        pub name: String,
    }

    #[derive(Debug, Default, Clone, Record)]
    pub struct Bad {
        pub id: i64,
        #[rowmap(tags = "unregistered")]
        pub name: String,
    }

    fn binder() -> TableBinder<MockConnection> {
        TableBinder::new(Arc::new(Db::new(MockConnection::new())))
            .add::<Good>("good")
            .add::<Bad>("bad")
            .add::<Good>("also_good")
    }

    #[test]
    fn test_sequential_bind_isolates_failures() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut bound = rt.block_on(binder().bind(&cx));
        assert!(!bound.is_ok());
        assert_eq!(bound.errors().len(), 1);
        assert!(bound.error("bad").unwrap().is_config());
        let good: Table<Good, MockConnection> = bound.take("good").unwrap();
        assert_eq!(good.name(), "good");
        assert!(bound.contains("also_good"));
    }

    #[test]
    fn test_parallel_bind_matches_sequential() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let mut bound = rt.block_on(binder().bind_parallel(&cx, 2));
        assert_eq!(bound.errors().len(), 1);
        assert!(bound.error("bad").is_some());
        // Wrong record type leaves the table in place.
        assert!(bound.take::<Bad, MockConnection>("also_good").is_none());
        assert!(bound.take::<Good, MockConnection>("also_good").is_some());
        assert!(bound.take::<Good, MockConnection>("also_good").is_none());
    }

    #[test]
    fn test_bind_checks_table_existence() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let build = || binder().add::<Good>("missing_table");

        let mut bound = rt.block_on(build().bind(&cx));
        let err = bound.error("missing_table").unwrap();
        assert_eq!(err.kind(), Some(ErrorKind::Preparation));
        assert!(!bound.contains("missing_table"));
        assert!(bound.take::<Good, MockConnection>("good").is_some());

        let bound = rt.block_on(build().bind_parallel(&cx, 3));
        assert!(bound.error("missing_table").is_some());
        assert!(bound.contains("also_good"));

        // Existence checks are skipped when the Db is configured without them.
        let config = DbConfig::default().check_table_existence(false);
        let db = Db::with_config(MockConnection::new(), config).unwrap();
        let bound = rt.block_on(
            TableBinder::new(Arc::new(db))
                .add::<Good>("missing_table")
                .bind(&cx),
        );
        assert!(bound.is_ok());
        assert!(bound.contains("missing_table"));
    }

    #[test]
    fn test_duplicate_names_bind_neither() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let binder = binder().add::<Bad>("good");
        assert_eq!(binder.len(), 4);

        let mut bound = rt.block_on(binder.bind_parallel(&cx, 2));
        assert!(!bound.contains("good"));
        assert!(bound.take::<Good, MockConnection>("good").is_none());
        let err = bound.error("good").unwrap();
        assert!(err.is_config());
        assert!(err.to_string().contains("registered 2 times"));
        assert!(bound.contains("also_good"));
        assert_eq!(bound.errors().len(), 2);
    }
}
