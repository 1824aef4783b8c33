mod common;

use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use common::{RecordingConnection, text, unwrap_outcome};
use ormflush::prelude::*;
use ormflush::{IsolationLevel, TransactionError, TransactionErrorKind};

fn builder() -> SessionBuilder<RecordingConnection> {
    SessionBuilder::new()
        .mapper(
            Mapper::builder("Account")
                .table("account")
                .column(Column::new("id").autoincrement())
                .column(Column::new("balance")),
        )
        .unwrap()
        .mapper(
            Mapper::builder("AuditEntry")
                .table("audit_entry")
                .bind("audit")
                .column(Column::new("id").autoincrement())
                .column(Column::new("message")),
        )
        .unwrap()
}

#[test]
fn test_unbound_mapper_is_rejected_at_build() {
    let err = builder()
        .build(RecordingConnection::postgres())
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("audit"));
}

#[test]
fn test_each_bind_gets_its_own_transaction() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let main = RecordingConnection::postgres();
    let audit = RecordingConnection::postgres();
    let mut s = builder()
        .bind("audit", audit.clone())
        .build(main.clone())
        .unwrap();

    s.create("Account", [("balance", Value::BigInt(100))]).unwrap();
    s.create("AuditEntry", [("message", text("opened"))]).unwrap();

    let result = rt.block_on(async { unwrap_outcome(s.flush(&cx, None).await) });

    assert_eq!(
        main.sql(),
        vec![
            "BEGIN",
            "INSERT INTO \"account\" (\"balance\") VALUES ($1) RETURNING \"id\"",
            "COMMIT",
        ]
    );
    assert_eq!(
        audit.sql(),
        vec![
            "BEGIN",
            "INSERT INTO \"audit_entry\" (\"message\") VALUES ($1) RETURNING \"id\"",
            "COMMIT",
        ]
    );
    assert_eq!(result.inserted, 2);
    assert_eq!(result.statements, 6);
}

#[test]
fn test_failure_on_one_bind_rolls_back_both() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let main = RecordingConnection::postgres();
    let audit = RecordingConnection::postgres();
    let mut s = builder()
        .bind("audit", audit.clone())
        .build(main.clone())
        .unwrap();

    let account = s.create("Account", [("balance", Value::BigInt(1))]).unwrap();
    let entry = s.create("AuditEntry", [("message", text("x"))]).unwrap();
    audit.fail_on("INSERT INTO \"audit_entry\"");

    let outcome = rt.block_on(async { s.flush(&cx, None).await });

    let Outcome::Err(err) = outcome else {
        std::panic::panic_any("flush should fail");
    };
    assert!(matches!(err, Error::Query(_)));
    assert_eq!(main.sql().last().map(String::as_str), Some("ROLLBACK"));
    assert_eq!(audit.sql().last().map(String::as_str), Some("ROLLBACK"));
    assert!(!main.sql().iter().any(|sql| sql == "COMMIT"));
    assert_eq!(s.status(account).unwrap(), InstanceStatus::Pending);
    assert_eq!(s.get(account, "id").unwrap(), None);
    assert!(s.is_new(entry));
}

#[test]
fn test_two_phase_commit_prepares_every_connection() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let main = RecordingConnection::postgres();
    let audit = RecordingConnection::postgres();
    let mut s = builder()
        .config(SessionConfig::new().two_phase(true))
        .bind("audit", audit.clone())
        .build(main.clone())
        .unwrap();

    s.create("Account", [("balance", Value::BigInt(5))]).unwrap();
    s.create("AuditEntry", [("message", text("deposit"))]).unwrap();
    rt.block_on(async { unwrap_outcome(s.flush(&cx, None).await) });

    for conn in [&main, &audit] {
        let sql = conn.sql();
        assert_eq!(sql.len(), 4);
        assert!(sql[2].starts_with("PREPARE TRANSACTION 'ormflush-"));
        assert!(sql[3].starts_with("COMMIT PREPARED 'ormflush-"));
        assert_eq!(sql[2]["PREPARE TRANSACTION ".len()..], sql[3]["COMMIT PREPARED ".len()..]);
    }
    assert_ne!(main.sql()[2], audit.sql()[2]);
}

#[test]
fn test_two_phase_rejected_on_mysql() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let main = RecordingConnection::new(Dialect::Mysql);
    let audit = RecordingConnection::new(Dialect::Mysql);
    let mut s = builder()
        .config(SessionConfig::new().two_phase(true))
        .bind("audit", audit)
        .build(main.clone())
        .unwrap();

    let account = s.create("Account", [("balance", Value::BigInt(5))]).unwrap();
    let outcome = rt.block_on(async { s.flush(&cx, None).await });

    assert!(matches!(
        outcome,
        Outcome::Err(Error::Transaction(TransactionError {
            kind: TransactionErrorKind::TwoPhaseNotSupported,
            ..
        }))
    ));
    assert_eq!(main.sql().last().map(String::as_str), Some("ROLLBACK"));
    assert!(s.is_new(account));
}

#[test]
fn test_session_transaction_spans_flushes_with_isolation() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let main = RecordingConnection::postgres();
    let audit = RecordingConnection::postgres();
    let mut s = builder()
        .config(
            SessionConfig::new()
                .nested_flush(false)
                .isolation(IsolationLevel::Serializable),
        )
        .bind("audit", audit.clone())
        .build(main.clone())
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    for (event, label) in [
        (SessionEvent::BeforeCommit, "before_commit"),
        (SessionEvent::AfterCommit, "after_commit"),
    ] {
        let log = Arc::clone(&events);
        s.on(event, move || {
            log.lock().unwrap().push(label);
            Ok(())
        });
    }

    s.begin().unwrap();
    let account = s.create("Account", [("balance", Value::BigInt(10))]).unwrap();
    rt.block_on(async {
        unwrap_outcome(s.flush(&cx, None).await);
        s.set(account, "balance", Value::BigInt(20)).unwrap();
        unwrap_outcome(s.commit(&cx).await);
    });

    assert_eq!(
        main.sql(),
        vec![
            "BEGIN ISOLATION LEVEL SERIALIZABLE",
            "INSERT INTO \"account\" (\"balance\") VALUES ($1) RETURNING \"id\"",
            "UPDATE \"account\" SET \"balance\" = $1 WHERE \"id\" = $2",
            "COMMIT",
        ]
    );
    // never touched, so never begun
    assert!(audit.sql().is_empty());
    assert_eq!(*events.lock().unwrap(), vec!["before_commit", "after_commit"]);
    assert!(s.state(account).unwrap().is_expired());
}

#[test]
fn test_failed_flush_without_savepoint_ends_session_transaction() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let main = RecordingConnection::postgres();
    let mut s = builder()
        .config(SessionConfig::new().nested_flush(false))
        .bind("audit", RecordingConnection::postgres())
        .build(main.clone())
        .unwrap();
    let rolled_back = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&rolled_back);
    s.on(SessionEvent::AfterRollback, move || {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    let existing = s
        .load_values("Account", [("id", Value::BigInt(1)), ("balance", Value::BigInt(0))])
        .unwrap();
    s.begin().unwrap();
    s.set(existing, "balance", Value::BigInt(50)).unwrap();
    main.matched_next(0);

    let outcome = rt.block_on(async { s.flush(&cx, None).await });

    let Outcome::Err(err) = outcome else {
        std::panic::panic_any("stale update should fail");
    };
    assert_eq!(err.flush_kind(), Some(FlushErrorKind::StaleData));
    assert!(
        err.to_string()
            .contains("UPDATE statement on table 'account' expected to update 1 row(s); 0 were matched.")
    );
    assert!(!s.in_transaction());
    assert_eq!(*rolled_back.lock().unwrap(), 1);
    // back to the state captured at begin
    assert_eq!(s.get(existing, "balance").unwrap(), Some(&Value::BigInt(0)));
    assert!(!s.is_dirty(existing));
}

#[test]
fn test_pooled_connection_drives_a_session() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    let backing = RecordingConnection::postgres();
    let pool: Pool<RecordingConnection> = Pool::new(PoolConfig::new(1).reset_on_return(false));

    rt.block_on(async {
        let factory = || {
            let conn = backing.clone();
            async move { Outcome::Ok(conn) }
        };
        let pooled = unwrap_outcome(pool.acquire(&cx, factory).await);
        let registry = Arc::new(
            MapperRegistry::new()
                .with(
                    Mapper::builder("Account")
                        .table("account")
                        .column(Column::new("id").autoincrement())
                        .column(Column::new("balance")),
                )
                .unwrap(),
        );
        let mut s = Session::new(registry, pooled);
        s.create("Account", [("balance", Value::BigInt(3))]).unwrap();
        unwrap_outcome(s.flush(&cx, None).await);
        assert_eq!(pool.stats().active_connections, 1);
        drop(s);
        assert_eq!(pool.stats().idle_connections, 1);
    });

    assert_eq!(backing.sql().len(), 3);
    assert_eq!(backing.sql()[0], "BEGIN");
}
