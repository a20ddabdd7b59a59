use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use slotd::tenant::TenantManager;
use slotd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("slotd")
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Every weekday bookable nearly around the clock, so tests can pick
/// arbitrary future times.
async fn configure_open_policy(client: &tokio_postgres::Client, org: &Ulid) {
    configure_open_policy_in(client, org, "UTC").await;
}

async fn configure_open_policy_in(client: &tokio_postgres::Client, org: &Ulid, timezone: &str) {
    let hours: Vec<String> = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]
        .iter()
        .map(|d| format!("{{\"weekday\":\"{d}\",\"start\":\"00:00\",\"end\":\"23:30\"}}"))
        .collect();
    let working_hours = format!("[{}]", hours.join(","));
    client
        .batch_execute(&format!(
            "INSERT INTO policies (organizer_id, timezone, working_hours, meeting_duration) \
             VALUES ('{org}', '{timezone}', '{working_hours}', 30)"
        ))
        .await
        .unwrap();
}

/// Tomorrow at the given UTC hour, RFC 3339.
fn tomorrow_at(hour: u32) -> String {
    let date = (Utc::now() + Duration::days(1)).date_naive();
    format!("{date}T{hour:02}:00:00Z")
}

fn data_rows(messages: &[SimpleQueryMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
        .count()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn configure_and_read_back_policy() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy(&client, &org).await;

    let rows = client
        .simple_query(&format!("SELECT * FROM policies WHERE organizer_id = '{org}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows), 1);
}

#[tokio::test]
async fn slots_are_offered_and_shrink_after_booking() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy(&client, &org).await;

    let before = client
        .simple_query(&format!("SELECT * FROM slots WHERE organizer_id = '{org}'"))
        .await
        .unwrap();
    let open_before = data_rows(&before);
    assert!(open_before > 0);

    client
        .batch_execute(&format!(
            "INSERT INTO bookings (organizer_id, invitee_name, invitee_email, invitee_timezone, \
             start_time) VALUES ('{org}', 'Ada', 'ada@example.com', 'UTC', '{}')",
            tomorrow_at(10)
        ))
        .await
        .unwrap();

    let after = client
        .simple_query(&format!("SELECT * FROM slots WHERE organizer_id = '{org}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&after), open_before - 1);
}

#[tokio::test]
async fn double_booking_rejected_with_unique_violation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy(&client, &org).await;

    let insert = format!(
        "INSERT INTO bookings (organizer_id, invitee_name, invitee_email, invitee_timezone, \
         start_time) VALUES ('{org}', 'Ada', 'ada@example.com', 'UTC', '{}')",
        tomorrow_at(14)
    );
    client.batch_execute(&insert).await.unwrap();

    let err = client.batch_execute(&insert).await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
}

#[tokio::test]
async fn racing_inserts_one_winner_across_connections() {
    let (addr, _tm) = start_test_server().await;
    let setup = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy(&setup, &org).await;

    let c1 = connect(addr).await;
    let c2 = connect(addr).await;
    let insert = format!(
        "INSERT INTO bookings (organizer_id, invitee_name, invitee_email, invitee_timezone, \
         start_time) VALUES ('{org}', 'Ada', 'ada@example.com', 'UTC', '{}')",
        tomorrow_at(9)
    );

    let (a, b) = tokio::join!(c1.batch_execute(&insert), c2.batch_execute(&insert));
    let oks = [a.is_ok(), b.is_ok()].iter().filter(|x| **x).count();
    assert_eq!(oks, 1, "exactly one racing insert commits");
}

#[tokio::test]
async fn reschedule_and_stale_version() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy(&client, &org).await;

    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, organizer_id, invitee_name, invitee_email, \
             invitee_timezone, start_time) VALUES ('{id}', '{org}', 'Ada', 'ada@example.com', \
             'UTC', '{}')",
            tomorrow_at(10)
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            "UPDATE bookings SET start_time = '{}' WHERE id = '{id}' AND version = 1",
            tomorrow_at(15)
        ))
        .await
        .unwrap();

    // Version 1 is stale now
    let err = client
        .batch_execute(&format!(
            "UPDATE bookings SET start_time = '{}' WHERE id = '{id}' AND version = 1",
            tomorrow_at(16)
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::T_R_SERIALIZATION_FAILURE));

    let rows = client
        .simple_query(&format!("SELECT * FROM bookings WHERE organizer_id = '{org}'"))
        .await
        .unwrap();
    let row = rows
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(row.get("version"), Some("2"));
    assert_eq!(row.get("start_time").unwrap(), tomorrow_at(15).replace('Z', "+00:00"));
}

#[tokio::test]
async fn cancel_frees_slot_for_rebooking() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy(&client, &org).await;

    let id = Ulid::new();
    let insert = format!(
        "INSERT INTO bookings (id, organizer_id, invitee_name, invitee_email, invitee_timezone, \
         start_time) VALUES ('{id}', '{org}', 'Ada', 'ada@example.com', 'UTC', '{}')",
        tomorrow_at(11)
    );
    client.batch_execute(&insert).await.unwrap();

    client
        .batch_execute(&format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{id}'"))
        .await
        .unwrap();

    // Same start, new invitee, fresh id
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (organizer_id, invitee_name, invitee_email, invitee_timezone, \
             start_time) VALUES ('{org}', 'Grace', 'grace@example.com', 'UTC', '{}')",
            tomorrow_at(11)
        ))
        .await
        .unwrap();

    let cancelled = client
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE organizer_id = '{org}' AND status = 'cancelled'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&cancelled), 1);
}

#[tokio::test]
async fn slots_default_to_utc_regardless_of_policy_timezone() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy_in(&client, &org, "America/New_York").await;

    // No display_timezone filter: rendered offset must be UTC, not the
    // organizer's local offset.
    let rows = client
        .simple_query(&format!("SELECT * FROM slots WHERE organizer_id = '{org}'"))
        .await
        .unwrap();
    let mut saw_row = false;
    for m in &rows {
        if let SimpleQueryMessage::Row(r) = m {
            saw_row = true;
            let start = r.get("start_time").unwrap();
            assert!(start.ends_with("+00:00"), "expected UTC offset, got {start}");
        }
    }
    assert!(saw_row);

    // An explicit display_timezone still overrides.
    let rows = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE organizer_id = '{org}' \
             AND display_timezone = 'Asia/Tokyo'"
        ))
        .await
        .unwrap();
    for m in &rows {
        if let SimpleQueryMessage::Row(r) = m {
            let start = r.get("start_time").unwrap();
            assert!(start.ends_with("+09:00"), "expected Tokyo offset, got {start}");
        }
    }
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    configure_open_policy(&client, &org).await;
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (organizer_id, invitee_name, invitee_email, invitee_timezone, \
             start_time) VALUES ('{org}', 'Ada', 'ada@example.com', 'UTC', '{}')",
            tomorrow_at(10)
        ))
        .await
        .unwrap();

    let rows = client
        .query(
            "SELECT * FROM bookings WHERE organizer_id = $1",
            &[&org.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let name: &str = rows[0].get("invitee_name");
    assert_eq!(name, "Ada");
}

#[tokio::test]
async fn listen_is_acknowledged() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let org = Ulid::new();
    client
        .batch_execute(&format!("LISTEN organizer_{org}"))
        .await
        .unwrap();

    // A bogus channel name is rejected
    let err = client.batch_execute("LISTEN organizer_notaulid").await;
    assert!(err.is_err());
}

#[tokio::test]
async fn tenants_are_isolated_over_the_wire() {
    let (addr, _tm) = start_test_server().await;

    let mut cfg_a = Config::new();
    cfg_a
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("tenant_a")
        .user("slotd")
        .password("slotd");
    let (client_a, conn_a) = cfg_a.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = conn_a.await;
    });

    let mut cfg_b = cfg_a.clone();
    cfg_b.dbname("tenant_b");
    let (client_b, conn_b) = cfg_b.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = conn_b.await;
    });

    let org = Ulid::new();
    configure_open_policy(&client_a, &org).await;

    let in_a = client_a
        .simple_query(&format!("SELECT * FROM policies WHERE organizer_id = '{org}'"))
        .await;
    assert!(in_a.is_ok());

    // Same organizer id does not exist for tenant B
    let in_b = client_b
        .simple_query(&format!("SELECT * FROM policies WHERE organizer_id = '{org}'"))
        .await;
    assert!(in_b.is_err());
}
