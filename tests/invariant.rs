use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use proptest::prelude::*;
use ulid::Ulid;

use menaje::config::EngineConfig;
use menaje::engine::{Engine, EngineError};
use menaje::model::*;
use menaje::notify::NotifyHub;

const ITEMS: usize = 2;
const RESERVATIONS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Save { reserva: usize, lines: Vec<(usize, u32)> },
    SetEstado { reserva: usize, estado: Estado },
}

fn estado() -> impl Strategy<Value = Estado> {
    prop_oneof![
        Just(Estado::Borrador),
        Just(Estado::Confirmado),
        Just(Estado::Devuelto),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..RESERVATIONS, prop::collection::vec((0..ITEMS, 0u32..8), 0..3))
            .prop_map(|(reserva, lines)| Op::Save { reserva, lines }),
        1 => (0..RESERVATIONS, estado()).prop_map(|(reserva, estado)| Op::SetEstado { reserva, estado }),
    ]
}

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join("menaje_test_invariant");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{}.wal", Ulid::new()))
}

/// Sum of committed quantities per (item, day) must stay within stock.
async fn assert_no_overbooking(engine: &Engine, items: &[InventoryItem], reservas: &[ReservationId]) {
    let mut per_day: HashMap<(ItemId, NaiveDate), u32> = HashMap::new();
    for id in reservas {
        let detail = engine.read_reservation(id).await.unwrap();
        if detail.reservation.estado == Estado::Devuelto {
            continue;
        }
        let window = detail.reservation.window;
        for line in &detail.lines {
            let mut day = window.start;
            while day <= window.end {
                *per_day.entry((line.menaje_id, day)).or_default() += line.cantidad;
                day = day.succ_opt().unwrap();
            }
        }
    }
    for item in items {
        for ((menaje_id, day), total) in &per_day {
            if *menaje_id == item.id {
                assert!(
                    *total <= item.stock_total,
                    "{} overbooked on {day}: {total} > {}",
                    item.nombre,
                    item.stock_total
                );
            }
        }
    }
}

async fn run(ops: Vec<Op>, offsets: Vec<u64>, stocks: Vec<u32>) {
    let config = EngineConfig {
        window: WindowPolicy { setup_days: 1, teardown_days: 1 },
        ..EngineConfig::default()
    };
    let engine = Engine::new(wal_path(), Arc::new(NotifyHub::new()), config).unwrap();

    let items: Vec<InventoryItem> = stocks
        .iter()
        .enumerate()
        .map(|(i, stock_total)| InventoryItem {
            id: Ulid::new(),
            nombre: format!("Articulo {i}"),
            unidad: Unidad::Pieza,
            stock_total: *stock_total,
        })
        .collect();
    for item in &items {
        engine.upsert_item(item.clone()).await.unwrap();
    }

    let base: NaiveDate = "2024-01-01".parse().unwrap();
    let mut reservas = Vec::new();
    for offset in &offsets {
        let fecha = base + Days::new(*offset);
        reservas.push(engine.get_or_create_reservation(Ulid::new(), fecha).await.unwrap().id);
    }

    for op in ops {
        match op {
            Op::Save { reserva, lines } => {
                let id = reservas[reserva];
                let mut seen = std::collections::HashSet::new();
                let proposed: Vec<ReservationLine> = lines
                    .into_iter()
                    .filter(|(item, _)| seen.insert(*item))
                    .map(|(item, cantidad)| ReservationLine { menaje_id: items[item].id, cantidad })
                    .collect();
                let before = engine.read_reservation(&id).await.unwrap();
                match engine.save_reservation_lines(id, proposed).await {
                    Ok(_) => {}
                    Err(EngineError::InsufficientStock(_)) | Err(EngineError::Returned(_)) => {
                        assert_eq!(engine.read_reservation(&id).await.unwrap(), before);
                    }
                    Err(e) => panic!("unexpected save error: {e}"),
                }
            }
            Op::SetEstado { reserva, estado } => {
                match engine.set_estado(reservas[reserva], estado).await {
                    Ok(_) | Err(EngineError::InvalidTransition { .. }) => {}
                    Err(e) => panic!("unexpected transition error: {e}"),
                }
            }
        }
        assert_no_overbooking(&engine, &items, &reservas).await;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn committed_stock_never_exceeds_total(
        ops in prop::collection::vec(op(), 1..40),
        offsets in prop::collection::vec(0u64..6, RESERVATIONS),
        stocks in prop::collection::vec(1u32..12, ITEMS),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(run(ops, offsets, stocks));
    }
}
