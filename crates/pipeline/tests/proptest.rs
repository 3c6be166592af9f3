//! Property-based tests for rill-pipeline using proptest.

use proptest::prelude::*;
use rill_core::{Order, Sort, TableBuilder, ValueType, Version};
use rill_incremental::{Input, Take};
use rill_pipeline::{PipelineConfig, PipelineDriver};
use rill_reactive::{Format, View};
use rill_storage::{Replica, StoredRow};
use std::collections::BTreeMap;
use std::rc::Rc;

fn replica() -> Replica {
    let replica = Replica::new();
    let spec = TableBuilder::new("items")
        .unwrap()
        .add_column("id", ValueType::Number)
        .unwrap()
        .add_column("rank", ValueType::Number)
        .unwrap()
        .add_primary_key(&["id"])
        .unwrap()
        .build()
        .unwrap();
    replica.create_table(spec).unwrap();
    replica
}

#[derive(Clone, Debug)]
enum Write {
    Set(i64, i64),
    Delete(i64),
    Truncate,
}

fn write_strategy() -> impl Strategy<Value = Write> {
    prop_oneof![
        8 => (0i64..30, 0i64..10).prop_map(|(id, rank)| Write::Set(id, rank)),
        4 => (0i64..30).prop_map(Write::Delete),
        1 => Just(Write::Truncate),
    ]
}

fn pairs(view: &View) -> Vec<(i64, i64)> {
    view.iter()
        .map(|e| (e.get("rank").as_i64().unwrap(), e.get("id").as_i64().unwrap()))
        .collect()
}

proptest! {
    /// After every advance the view holds the first `limit` rows of the
    /// table at the new head, whether the diff was pushed or the driver reset.
    #[test]
    fn view_tracks_replica(
        batches in prop::collection::vec(prop::collection::vec(write_strategy(), 0..6), 1..12),
        limit in 1usize..6,
        threshold in prop::option::of(0usize..6),
    ) {
        let replica = replica();
        let config = PipelineConfig {
            max_changes_per_advance: threshold,
            ..PipelineConfig::default()
        };
        let mut driver = PipelineDriver::new(&replica, config);
        driver.init().unwrap();
        driver
            .add_query("top", Format::list(), move |d: &PipelineDriver| {
                let sort = Sort::new([("rank", Order::Desc), ("id", Order::Asc)]);
                let input: Rc<dyn Input> = Take::new(d.source("items")?.connect(sort, None)?, limit, None)?;
                Ok(input)
            })
            .unwrap();

        let mut table: BTreeMap<i64, i64> = BTreeMap::new();
        for (n, batch) in batches.into_iter().enumerate() {
            let mut tx = replica.begin(Version::from_u64(n as u64 + 1)).unwrap();
            for write in batch {
                match write {
                    Write::Set(id, rank) => {
                        tx.set("items", StoredRow::new().with("id", id).with("rank", rank)).unwrap();
                        table.insert(id, rank);
                    }
                    Write::Delete(id) => {
                        tx.delete("items", &StoredRow::new().with("id", id)).unwrap();
                        table.remove(&id);
                    }
                    Write::Truncate => {
                        tx.truncate("items").unwrap();
                        table.clear();
                    }
                }
            }
            tx.commit().unwrap();
            driver.advance().unwrap();

            let mut expected: Vec<(i64, i64)> = table.iter().map(|(&id, &rank)| (rank, id)).collect();
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            expected.truncate(limit);
            let view = driver.query("top").unwrap();
            prop_assert_eq!(pairs(&view.data()), expected);
        }
    }
}
