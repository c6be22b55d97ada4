use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use menaje::config::EngineConfig;
use menaje::tenant::TenantManager;
use menaje::wire;

const PASSWORD: &str = "menaje";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("menaje_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, EngineConfig::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string()).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_as(addr: SocketAddr, dbname: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("menaje")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "salon", PASSWORD).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

async fn add_item(client: &Client, nombre: &str, stock: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO menaje (id, nombre, unidad, stock_total) VALUES ('{id}', '{nombre}', 'pieza', {stock})"
        ))
        .await
        .unwrap();
    id
}

async fn reserva_for(client: &Client, evento: Ulid, fecha: &str) -> String {
    let row = rows(
        client,
        &format!("INSERT INTO reservas (evento_id, fecha) VALUES ('{evento}', '{fecha}')"),
    )
    .await;
    row[0].get("id").unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn catalog_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let id = add_item(&client, "Mesa redonda", 20).await;
    let items = rows(&client, "SELECT * FROM menaje").await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(items[0].get("nombre"), Some("Mesa redonda"));
    assert_eq!(items[0].get("unidad"), Some("pieza"));
    assert_eq!(items[0].get("stock_total"), Some("20"));

    add_item(&client, "Silla", 40).await;
    let one = rows(&client, &format!("SELECT * FROM menaje WHERE id = '{id}'")).await;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].get("nombre"), Some("Mesa redonda"));

    let err = client
        .batch_execute(&format!("SELECT * FROM menaje WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");
}

#[tokio::test]
async fn reservation_get_or_create_is_idempotent() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let evento = Ulid::new();
    let first = reserva_for(&client, evento, "2024-01-10").await;
    let second = reserva_for(&client, evento, "2024-01-10").await;
    assert_eq!(first, second);

    let by_id = rows(&client, &format!("SELECT * FROM reservas WHERE id = '{first}'")).await;
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].get("estado"), Some("borrador"));
    assert_eq!(by_id[0].get("fecha_inicio"), Some("2024-01-10"));
    assert_eq!(by_id[0].get("fecha_fin"), Some("2024-01-10"));
    assert_eq!(by_id[0].get("evento_id"), Some(evento.to_string().as_str()));
}

#[tokio::test]
async fn overbooking_is_rejected_with_violation_detail() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let mesa = add_item(&client, "Mesa redonda", 20).await;
    let a = reserva_for(&client, Ulid::new(), "2024-01-11").await;
    let b = reserva_for(&client, Ulid::new(), "2024-01-11").await;

    client
        .batch_execute(&format!(
            "INSERT INTO reserva_lineas (reserva_id, menaje_id, cantidad) VALUES ('{a}', '{mesa}', 15)"
        ))
        .await
        .unwrap();

    let avail = rows(
        &client,
        &format!(
            "SELECT * FROM disponibilidad WHERE fecha_inicio = '2024-01-11' AND fecha_fin = '2024-01-11' AND excluir_reserva = '{b}'"
        ),
    )
    .await;
    assert_eq!(avail.len(), 1);
    assert_eq!(avail[0].get("reservado"), Some("15"));
    assert_eq!(avail[0].get("disponible"), Some("5"));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO reserva_lineas (reserva_id, menaje_id, cantidad) VALUES ('{b}', '{mesa}', 6)"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    let message = err.as_db_error().unwrap().message().to_string();
    assert!(message.contains("\"requested\":6"), "{message}");
    assert!(message.contains("\"available\":5"), "{message}");

    client
        .batch_execute(&format!(
            "INSERT INTO reserva_lineas (reserva_id, menaje_id, cantidad) VALUES ('{b}', '{mesa}', 5)"
        ))
        .await
        .unwrap();

    let lines = rows(&client, &format!("SELECT * FROM reserva_lineas WHERE reserva_id = '{b}'")).await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].get("nombre"), Some("Mesa redonda"));
    assert_eq!(lines[0].get("cantidad"), Some("5"));
}

#[tokio::test]
async fn returning_releases_stock_and_locks_lines() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let silla = add_item(&client, "Silla", 4).await;
    let r = reserva_for(&client, Ulid::new(), "2024-02-01").await;
    client
        .batch_execute(&format!(
            "INSERT INTO reserva_lineas (reserva_id, menaje_id, cantidad) VALUES ('{r}', '{silla}', 4)"
        ))
        .await
        .unwrap();

    let estado = rows(
        &client,
        &format!("INSERT INTO reserva_estados (reserva_id, estado) VALUES ('{r}', 'devuelto')"),
    )
    .await;
    assert_eq!(estado[0].get("estado"), Some("devuelto"));

    let avail = rows(
        &client,
        "SELECT * FROM disponibilidad WHERE fecha_inicio = '2024-02-01' AND fecha_fin = '2024-02-01'",
    )
    .await;
    assert_eq!(avail[0].get("disponible"), Some("4"));

    let err = client
        .batch_execute(&format!("DELETE FROM reserva_lineas WHERE reserva_id = '{r}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    let err = client
        .batch_execute(&format!(
            "INSERT INTO reserva_estados (reserva_id, estado) VALUES ('{r}', 'confirmado')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");
}

#[tokio::test]
async fn delete_clears_lines() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let mesa = add_item(&client, "Mesa", 3).await;
    let copa = add_item(&client, "Copa", 30).await;
    let r = reserva_for(&client, Ulid::new(), "2024-03-01").await;
    client
        .batch_execute(&format!(
            "INSERT INTO reserva_lineas (reserva_id, menaje_id, cantidad) VALUES ('{r}', '{mesa}', 2), ('{r}', '{copa}', 24)"
        ))
        .await
        .unwrap();

    let deleted = client
        .execute(&format!("DELETE FROM reserva_lineas WHERE reserva_id = '{r}'"), &[])
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    let lines = rows(&client, &format!("SELECT * FROM reserva_lineas WHERE reserva_id = '{r}'")).await;
    assert!(lines.is_empty());
}

#[tokio::test]
async fn engine_errors_map_to_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let missing = Ulid::new();
    let err = client
        .batch_execute(&format!("SELECT * FROM reservas WHERE id = '{missing}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    let mesa = add_item(&client, "Mesa", 3).await;
    let r = reserva_for(&client, Ulid::new(), "2024-03-01").await;
    let err = client
        .batch_execute(&format!(
            "INSERT INTO reserva_lineas (reserva_id, menaje_id, cantidad) VALUES ('{r}', '{mesa}', 1), ('{r}', '{mesa}', 2)"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23505");

    let err = client
        .batch_execute(
            "SELECT * FROM disponibilidad WHERE fecha_inicio = '2024-03-05' AND fecha_fin = '2024-03-01'",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    let err = client.batch_execute("SELEKT nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}

#[tokio::test]
async fn prepared_statements_take_text_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new().to_string();
    let inserted = client
        .execute(
            "INSERT INTO menaje (id, nombre, unidad, stock_total) VALUES ($1, $2, $3, $4)",
            &[&id, &"Mantel", &"metro", &"12"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let items = rows(&client, "SELECT * FROM menaje").await;
    assert_eq!(items[0].get("unidad"), Some("metro"));
    assert_eq!(items[0].get("stock_total"), Some("12"));
}

#[tokio::test]
async fn databases_are_separate_tenants() {
    let (addr, _tm) = start_test_server().await;
    let salon = connect_as(addr, "salon_norte", PASSWORD).await.unwrap();
    let jardin = connect_as(addr, "jardin_sur", PASSWORD).await.unwrap();

    add_item(&salon, "Carpa", 2).await;
    assert_eq!(rows(&salon, "SELECT * FROM menaje").await.len(), 1);
    assert!(rows(&jardin, "SELECT * FROM menaje").await.is_empty());
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _tm) = start_test_server().await;
    assert!(connect_as(addr, "salon", "not-the-password").await.is_err());
}
