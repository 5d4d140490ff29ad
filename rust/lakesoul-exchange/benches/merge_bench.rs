// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::hint::black_box;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array};
use arrow::record_batch::RecordBatch;
use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use lakesoul_exchange::config::{MergeConfig, MergeStrategy};
use lakesoul_exchange::exchange::{ArrowIpcSerde, LocalExchange, PagesSerde, SerializedPage};
use lakesoul_exchange::operator::{SourceOperator, Split};
use lakesoul_exchange::sorted_merge::{MergeOperatorFactory, SortColumn, SortKey};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use url::Url;

const ROWS_PER_SOURCE: usize = 4096;
const ROWS_PER_PAGE: usize = 256;

fn serialized_sources(fan_in: usize) -> Vec<Vec<SerializedPage>> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..fan_in)
        .map(|_| {
            let mut keys = (0..ROWS_PER_SOURCE)
                .map(|_| rng.gen_range(0..1_000_000i64))
                .collect::<Vec<_>>();
            keys.sort_unstable();
            keys.chunks(ROWS_PER_PAGE)
                .map(|chunk| {
                    let k: ArrayRef = Arc::new(Int64Array::from(chunk.to_vec()));
                    let batch = RecordBatch::try_from_iter(vec![("k", k)]).unwrap();
                    ArrowIpcSerde.serialize(&batch).unwrap()
                })
                .collect()
        })
        .collect()
}

fn merge_all(exchange: &LocalExchange, fan_in: usize, strategy: MergeStrategy) -> usize {
    let k: ArrayRef = Arc::new(Int64Array::from(Vec::<i64>::new()));
    let schema = RecordBatch::try_from_iter(vec![("k", k)]).unwrap().schema();
    let config = MergeConfig::builder().with_merge_strategy(strategy).build().unwrap();
    let factory = MergeOperatorFactory::try_new(
        "bench",
        exchange.client_supplier(),
        Arc::new(ArrowIpcSerde),
        schema,
        vec![0],
        SortKey::new(vec![SortColumn::asc(0)]),
        config,
    )
    .unwrap();
    let mut operator = factory.create_operator(0).unwrap();
    for i in 0..fan_in {
        operator.register_split(Split::remote(location(i))).unwrap();
    }
    operator.no_more_splits().unwrap();

    let mut rows = 0;
    while !operator.is_finished() {
        if let Some(page) = operator.pull().unwrap() {
            rows += page.num_rows();
        }
    }
    operator.close().unwrap();
    rows
}

fn location(i: usize) -> Url {
    Url::parse(&format!("http://worker-{i}/results/0")).unwrap()
}

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge_Strategy");
    for fan_in in [4, 16, 64] {
        let sources = serialized_sources(fan_in);
        for strategy in [MergeStrategy::LinearScan, MergeStrategy::Heap] {
            group.bench_with_input(BenchmarkId::new(strategy.to_string(), fan_in), &sources, |b, sources| {
                b.iter_batched(
                    || {
                        let exchange = LocalExchange::new();
                        for (i, pages) in sources.iter().enumerate() {
                            let producer = exchange.producer(&location(i));
                            for page in pages {
                                producer.push(page.clone()).unwrap();
                            }
                            producer.finish();
                        }
                        exchange
                    },
                    |exchange| black_box(merge_all(&exchange, fan_in, strategy)),
                    BatchSize::SmallInput,
                )
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_strategies);
criterion_main!(benches);
