use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotbook::notify::LogNotifier;
use slotbook::tenant::StudioManager;
use slotbook::wire::{self, ServerContext};

const PASSWORD: &str = "slotbook";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let ctx = ServerContext {
        studios: Arc::new(StudioManager::new(dir, 1000)),
        password: PASSWORD.to_string(),
        admin_user: "admin".to_string(),
        notifier: Arc::new(LogNotifier),
    };

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, ctx, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("studio")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|db| db.code().code())
}

/// Registers and verifies a profile through the admin connection.
async fn enrol(admin: &Client, email: &str, name: &str, role: &str) -> Ulid {
    let id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO profiles (id, email, name, role) VALUES ('{id}', '{email}', '{name}', '{role}')"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!("UPDATE profiles SET verified = true WHERE id = '{id}'"))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_cancel_and_report_over_the_wire() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;

    enrol(&admin, "sato@studio.test", "Sato", "teacher").await;
    enrol(&admin, "alice@studio.test", "Alice", "student").await;
    enrol(&admin, "bob@studio.test", "Bob", "student").await;

    let teacher = connect(addr, "sato@studio.test").await;
    let math = Ulid::new();
    teacher
        .batch_execute(&format!("INSERT INTO subjects (id, name) VALUES ('{math}', 'Math')"))
        .await
        .unwrap();
    let shift = Ulid::new();
    teacher
        .batch_execute(&format!(
            "INSERT INTO shifts (id, date, start_time, end_time, subjects) \
             VALUES ('{shift}', '2024-06-01', '09:00', '10:00', '{math}')"
        ))
        .await
        .unwrap();

    let alice = connect(addr, "alice@studio.test").await;
    let open = rows(&alice, "SELECT * FROM availability WHERE date = '2024-06-01'").await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].get("id"), Some(shift.to_string().as_str()));
    assert_eq!(open[0].get("start_time"), Some("09:00"));

    let reservation = Ulid::new();
    alice
        .batch_execute(&format!(
            "INSERT INTO reservations (id, shift_id, subject_id, notes) \
             VALUES ('{reservation}', '{shift}', '{math}', 'chapter 3')"
        ))
        .await
        .unwrap();
    assert!(rows(&alice, "SELECT * FROM availability WHERE date = '2024-06-01'").await.is_empty());

    let bob = connect(addr, "bob@studio.test").await;
    let err = bob
        .batch_execute(&format!(
            "INSERT INTO reservations (shift_id, subject_id) VALUES ('{shift}', '{math}')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    // Bob only sees his own (none); the teacher sees Alice's.
    assert!(rows(&bob, "SELECT * FROM reservations").await.is_empty());
    let on_my_shifts = rows(&teacher, "SELECT * FROM reservations").await;
    assert_eq!(on_my_shifts.len(), 1);
    assert_eq!(on_my_shifts[0].get("status"), Some("confirmed"));

    let stats = rows(&admin, "SELECT * FROM stats").await;
    assert_eq!(stats[0].get("total_shifts"), Some("1"));
    assert_eq!(stats[0].get("occupancy_rate"), Some("100"));

    // Students may not complete a lesson; they may cancel it.
    let err = alice
        .batch_execute(&format!("UPDATE reservations SET status = 'completed' WHERE id = '{reservation}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));
    alice
        .batch_execute(&format!("UPDATE reservations SET status = 'cancelled' WHERE id = '{reservation}'"))
        .await
        .unwrap();

    let again = rows(&bob, "SELECT * FROM availability WHERE date = '2024-06-01'").await;
    assert_eq!(again.len(), 1);

    let export = rows(&admin, "SELECT * FROM export WHERE kind = 'reservations'").await;
    let csv = export[0].get("csv").unwrap();
    assert!(csv.starts_with("id,student_id,student_name,"));
    assert!(csv.contains(",Alice,2024-06-01,09:00,10:00,Math,cancelled,chapter 3,"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    enrol(&admin, "kana@studio.test", "Kana", "teacher").await;

    let teacher = connect(addr, "kana@studio.test").await;
    let physics = Ulid::new();
    teacher
        .execute(
            "INSERT INTO subjects (id, name) VALUES ($1, $2)",
            &[&physics.to_string(), &"Physics"],
        )
        .await
        .unwrap();
    for (start, end) in [("13:00", "14:00"), ("14:00", "15:30")] {
        teacher
            .execute(
                "INSERT INTO shifts (date, start_time, end_time, subjects) VALUES ($1, $2, $3, $4)",
                &[&"2024-06-02", &start, &end, &physics.to_string()],
            )
            .await
            .unwrap();
    }

    let found = teacher
        .query(
            "SELECT * FROM availability WHERE subject_id = $1",
            &[&physics.to_string()],
        )
        .await
        .unwrap();
    let starts: Vec<String> = found.iter().map(|r| r.get("start_time")).collect();
    assert_eq!(starts, vec!["13:00", "14:00"]);

    // Overlap with the 14:00-15:30 shift.
    let err = teacher
        .execute(
            "INSERT INTO shifts (date, start_time, end_time, subjects) VALUES ($1, $2, $3, $4)",
            &[&"2024-06-02", &"15:00", &"16:00", &physics.to_string()],
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
}

#[tokio::test]
async fn unverified_and_unknown_logins_are_refused() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    admin
        .batch_execute(&format!(
            "INSERT INTO profiles (id, email, name, role) VALUES ('{}', 'new@studio.test', 'New', 'student')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let unverified = connect(addr, "new@studio.test").await;
    let err = unverified.simple_query("SELECT * FROM subjects").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let stranger = connect(addr, "nobody@studio.test").await;
    let err = stranger.simple_query("SELECT * FROM subjects").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;

    let err = admin
        .batch_execute("INSERT INTO shifts (date) VALUES ('tomorrow')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = admin.batch_execute("SELECT * FROM availability").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}
