use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Days, NaiveDate, Utc};
use innsync_core::{ConnectionId, HotelId, RoomTypeId, StayRange};
use innsync_infra::ledger::{InMemoryInventoryLedger, InventoryLedger};
use innsync_infra::queue::{
    InMemoryPublishQueue, PublishQueue, PublishTaskInput, RetryPolicy, RoomScope, TaskKind,
    TaskPayload, TaskPriority,
};
use innsync_inventory::{InventoryBook, InventoryDayLoad, InventoryKey, Restrictions};

const SEASON_START: &str = "2024-06-01";

fn season_start() -> NaiveDate {
    SEASON_START.parse().unwrap()
}

fn stay(offset: u64, nights: u64) -> StayRange {
    let check_in = season_start() + Days::new(offset);
    StayRange::new(check_in, check_in + Days::new(nights)).unwrap()
}

fn loaded_book(hotel_id: HotelId, room_type_id: RoomTypeId, days: u64, allotment: u32) -> InventoryBook {
    let mut book = InventoryBook::new();
    let now = Utc::now();
    for offset in 0..days {
        book.load(
            &InventoryDayLoad {
                key: InventoryKey::new(hotel_id, room_type_id, season_start() + Days::new(offset)),
                allotment,
                restrictions: Restrictions::default(),
            },
            now,
        );
    }
    book
}

fn bench_book_reserve_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("book_reserve_release");
    let (hotel_id, room_type_id) = (HotelId::new(), RoomTypeId::new());

    for nights in [1u64, 3, 7, 14] {
        group.throughput(Throughput::Elements(nights));
        group.bench_with_input(BenchmarkId::from_parameter(nights), &nights, |b, &nights| {
            let mut book = loaded_book(hotel_id, room_type_id, 30, 10);
            let range = stay(0, nights);
            b.iter(|| {
                let now = Utc::now();
                book.reserve(hotel_id, room_type_id, black_box(&range), now).unwrap();
                black_box(book.release(hotel_id, room_type_id, &range, now));
            });
        });
    }
    group.finish();
}

fn bench_rejected_reserve(c: &mut Criterion) {
    let (hotel_id, room_type_id) = (HotelId::new(), RoomTypeId::new());
    let book = loaded_book(hotel_id, room_type_id, 30, 0);
    let range = stay(0, 7);

    c.bench_function("book_check_reserve_sold_out", |b| {
        b.iter(|| black_box(book.check_reserve(hotel_id, room_type_id, black_box(&range)).is_err()))
    });
}

fn bench_ledger_under_contention(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (hotel_id, room_type_id) = (HotelId::new(), RoomTypeId::new());
    let ledger = InMemoryInventoryLedger::arc();
    rt.block_on(async {
        for offset in 0..30 {
            ledger
                .load_day(InventoryDayLoad {
                    key: InventoryKey::new(hotel_id, room_type_id, season_start() + Days::new(offset)),
                    allotment: 64,
                    restrictions: Restrictions::default(),
                })
                .await
                .unwrap();
        }
    });

    c.bench_function("ledger_concurrent_reserve_16x3n", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handles: Vec<_> = (0..16)
                    .map(|i| {
                        let ledger = ledger.clone();
                        tokio::spawn(async move {
                            let range = stay(i % 10, 3);
                            ledger.reserve(hotel_id, room_type_id, range).await?;
                            ledger.release(hotel_id, room_type_id, range).await
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap().unwrap();
                }
            })
        })
    });
}

fn bench_queue_coalescing(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let queue = InMemoryPublishQueue::arc(RetryPolicy::default());
    let connection_id = ConnectionId::new();
    let room_type_id = RoomTypeId::new();

    c.bench_function("queue_enqueue_coalesced", |b| {
        b.iter(|| {
            rt.block_on(async {
                for offset in 0..32 {
                    let input = PublishTaskInput {
                        connection_id,
                        kind: TaskKind::Availability,
                        priority: TaskPriority::Normal,
                        payload: TaskPayload {
                            room_scope: RoomScope::RoomType(room_type_id),
                            range: stay(offset % 8, 1),
                        },
                    };
                    black_box(queue.enqueue(input).await.unwrap());
                }
            })
        })
    });
}

criterion_group!(
    benches,
    bench_book_reserve_release,
    bench_rejected_reserve,
    bench_ledger_under_contention,
    bench_queue_coalescing
);
criterion_main!(benches);
