//! Full engine runs against an in-memory warehouse and metadata store.

use std::collections::BTreeMap;

use weir::algebra::Path;
use weir::config::{EmptyGeneratorPolicy, RunOptions};
use weir::db::{Database, MetaStore, SqliteDb};
use weir::engine::{Engine, EngineError, GeneratorStatus};
use weir::generator::{Generator, Transform, TransformOutcome};
use weir::load::{Load, RelSource, ValueSource};
use weir::model::{Attr, AttrType, Entity, OnDelete, Rel, Schema};
use weir::query::{col, Query};
use weir::value::Value;

fn stores() -> (SqliteDb, MetaStore) {
    (
        SqliteDb::open_in_memory().unwrap(),
        MetaStore::open_in_memory().unwrap(),
    )
}

fn apply_ddl(db: &mut SqliteDb, schema: &Schema) {
    for statement in schema.ddl() {
        db.execute(&statement).unwrap();
    }
}

fn fk_schema() -> Schema {
    let other_obj = Entity::new(
        "other_obj",
        vec![Attr::new("other_attr", AttrType::Text).identifying()],
        vec![],
    )
    .unwrap();
    let my_obj = Entity::new(
        "my_obj",
        vec![Attr::new("my_attr", AttrType::Int).identifying()],
        vec![Rel::new("my_fk", "my_obj", "other_obj", true, OnDelete::Restrict)],
    )
    .unwrap();
    Schema::new(vec![other_obj, my_obj]).unwrap()
}

fn row_generator(name: &str, my_attr: i64, my_fk: i64) -> Generator {
    Generator::new(name).load(
        Load::insert("my_obj")
            .set("my_attr", ValueSource::Const(Value::Int(my_attr)))
            .rel("my_fk", RelSource::Key(ValueSource::Const(Value::Int(my_fk)))),
    )
}

#[test]
fn rows_land_with_resolved_foreign_keys() {
    let schema = fk_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);
    db.execute(
        "INSERT INTO other_obj (other_obj_id, other_attr) VALUES (0, 'cat'), (1, 'dog')",
    )
    .unwrap();

    // One load with list-valued sources; the loader broadcasts them to
    // a common length of three.
    let rows = Generator::new("rows").load(
        Load::insert("my_obj")
            .set(
                "my_attr",
                ValueSource::ConstList(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            )
            .rel(
                "my_fk",
                RelSource::Key(ValueSource::ConstList(vec![
                    Value::Int(0),
                    Value::Int(1),
                    Value::Int(0),
                ])),
            ),
    );
    let engine = Engine::new(schema, vec![rows], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(!report.failed());
    assert_eq!(report.error_count, 0);
    assert_eq!(
        report.statuses["rows"],
        GeneratorStatus::Completed {
            rows_in: 1,
            rows_loaded: 3
        }
    );

    let batch = db
        .query(
            "SELECT my_obj.my_attr, other_obj.other_attr FROM my_obj \
             JOIN other_obj ON my_obj.my_fk = other_obj.other_obj_id \
             ORDER BY my_obj.my_attr",
        )
        .unwrap();
    assert_eq!(
        batch.rows,
        vec![
            vec![Value::Int(1), Value::Text("cat".into())],
            vec![Value::Int(2), Value::Text("dog".into())],
            vec![Value::Int(3), Value::Text("cat".into())],
        ]
    );
}

fn copy_schema() -> Schema {
    let seed = Entity::new(
        "seed",
        vec![Attr::new("label", AttrType::Text).identifying()],
        vec![],
    )
    .unwrap();
    let copy = Entity::new(
        "copy",
        vec![Attr::new("label", AttrType::Text).identifying()],
        vec![],
    )
    .unwrap();
    Schema::new(vec![seed, copy]).unwrap()
}

fn copy_generator() -> Generator {
    let query = Query::new()
        .with_basis("seed")
        .select("label", col(Path::to("seed").attr("label")));
    Generator::new("copy_labels").with_query(query).load(
        Load::insert("copy").set("label", ValueSource::Query { column: "label".into() }),
    )
}

#[test]
fn repeated_runs_skip_processed_rows_until_retry() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);
    db.execute("INSERT INTO seed (seed_id, label) VALUES (1, 'x'), (2, 'y')")
        .unwrap();

    let engine = Engine::new(copy_schema(), vec![copy_generator()], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert_eq!(
        report.statuses["copy_labels"],
        GeneratorStatus::Completed {
            rows_in: 2,
            rows_loaded: 2
        }
    );

    // Same ledger, same rows: everything is a repeat.
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert_eq!(
        report.statuses["copy_labels"],
        GeneratorStatus::Completed {
            rows_in: 0,
            rows_loaded: 0
        }
    );

    // Retry ignores the ledger and converges on the same two rows.
    let mut retry = RunOptions::default();
    retry.retry = true;
    let engine = Engine::new(schema, vec![copy_generator()], retry);
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert_eq!(
        report.statuses["copy_labels"],
        GeneratorStatus::Completed {
            rows_in: 2,
            rows_loaded: 2
        }
    );
    let batch = db.query("SELECT COUNT(*) FROM copy").unwrap();
    assert_eq!(batch.rows[0][0], Value::Int(2));
}

#[test]
fn transform_outputs_feed_loads() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);

    let make = Transform::new(
        "make",
        vec![ValueSource::Const(Value::Int(7))],
        vec!["label"],
        |_row| {
            let mut out = BTreeMap::new();
            out.insert("label".to_string(), Value::Text("hi".into()));
            TransformOutcome::Produced(out)
        },
    );
    let generator = Generator::new("make_copy").transform(make).load(
        Load::insert("copy").set(
            "label",
            ValueSource::Transform {
                step: "make".into(),
                output: "label".into(),
            },
        ),
    );

    let engine = Engine::new(schema, vec![generator], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(!report.failed());

    let batch = db.query("SELECT label FROM copy").unwrap();
    assert_eq!(batch.rows, vec![vec![Value::Text("hi".into())]]);
}

#[test]
fn failing_transform_fails_its_generator_but_not_the_run() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);

    let broken = Transform::new(
        "explode",
        vec![ValueSource::Const(Value::Int(1))],
        vec!["out"],
        |_row| TransformOutcome::Failed("bad row".into()),
    );
    let bad = Generator::new("bad").transform(broken).load(
        Load::insert("copy").set(
            "label",
            ValueSource::Transform {
                step: "explode".into(),
                output: "out".into(),
            },
        ),
    );
    let good = Generator::new("good").load(
        Load::insert("copy").set("label", ValueSource::Const(Value::Text("ok".into()))),
    );

    let engine = Engine::new(schema, vec![bad, good], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();

    assert!(report.failed());
    assert_eq!(report.error_count, 1);
    let record = meta.run(&report.run_id).unwrap().unwrap();
    assert_eq!(record.status, "failed");
    assert_eq!(record.error_count, 1);
    assert!(matches!(
        &report.statuses["bad"],
        GeneratorStatus::Failed { message } if message.contains("bad row")
    ));
    assert!(matches!(
        report.statuses["good"],
        GeneratorStatus::Completed { .. }
    ));
    let batch = db.query("SELECT COUNT(*) FROM copy").unwrap();
    assert_eq!(batch.rows[0][0], Value::Int(1));
}

#[test]
fn empty_query_respects_the_policy() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);
    // The seed table stays empty.

    let engine = Engine::new(copy_schema(), vec![copy_generator()], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(matches!(
        report.statuses["copy_labels"],
        GeneratorStatus::Failed { .. }
    ));

    let mut allow = RunOptions::default();
    allow.empty_generators = EmptyGeneratorPolicy::Allow;
    let engine = Engine::new(schema, vec![copy_generator()], allow);
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert_eq!(
        report.statuses["copy_labels"],
        GeneratorStatus::Completed {
            rows_in: 0,
            rows_loaded: 0
        }
    );
}

#[test]
fn load_less_generators_respect_the_policy() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);

    let idle = || Generator::new("idle");

    let engine = Engine::new(copy_schema(), vec![idle()], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(matches!(
        &report.statuses["idle"],
        GeneratorStatus::Failed { message } if message.contains("no loads")
    ));

    let mut allow = RunOptions::default();
    allow.empty_generators = EmptyGeneratorPolicy::Allow;
    let engine = Engine::new(copy_schema(), vec![idle()], allow);
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(matches!(
        report.statuses["idle"],
        GeneratorStatus::Completed { .. }
    ));

    // An io-tagged generator's side effects are its work.
    let engine = Engine::new(schema, vec![idle().tag("io")], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(matches!(
        report.statuses["idle"],
        GeneratorStatus::Completed { .. }
    ));
}

#[test]
fn ledger_keeps_batches_loaded_before_a_failure() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);
    db.execute("INSERT INTO seed (seed_id, label) VALUES (1, 'ok'), (2, 'zz')")
        .unwrap();

    // Single-row batches; the second batch fails mid-generator on the
    // first attempt. Both variants hash identically, since closures are
    // not part of the generator's content hash.
    let gated = |fail_on_zz: bool| {
        let query = Query::new()
            .with_basis("seed")
            .select("label", col(Path::to("seed").attr("label")));
        let gate = Transform::new(
            "gate",
            vec![ValueSource::Query { column: "label".into() }],
            vec!["out"],
            move |row| match row.get("label") {
                Some(Value::Text(s)) if fail_on_zz && s.as_str() == "zz" => {
                    TransformOutcome::Failed("bad label".into())
                }
                Some(value) => {
                    let mut out = BTreeMap::new();
                    out.insert("out".to_string(), value.clone());
                    TransformOutcome::Produced(out)
                }
                None => TransformOutcome::Failed("missing label".into()),
            },
        );
        Generator::new("gated_copy")
            .with_query(query)
            .transform(gate)
            .load(Load::insert("copy").set(
                "label",
                ValueSource::Transform {
                    step: "gate".into(),
                    output: "out".into(),
                },
            ))
            .with_batch_size(1)
    };

    let engine = Engine::new(copy_schema(), vec![gated(true)], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(report.failed());
    let batch = db.query("SELECT label FROM copy").unwrap();
    assert_eq!(batch.rows, vec![vec![Value::Text("ok".into())]]);

    // The first batch made it into the ledger before the failure, so a
    // rerun only processes the row that never loaded.
    let engine = Engine::new(copy_schema(), vec![gated(false)], RunOptions::default());
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert_eq!(
        report.statuses["gated_copy"],
        GeneratorStatus::Completed {
            rows_in: 1,
            rows_loaded: 1
        }
    );
    let batch = db.query("SELECT COUNT(*) FROM copy").unwrap();
    assert_eq!(batch.rows[0][0], Value::Int(2));
}

#[test]
fn filters_naming_unknown_generators_are_rejected() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);

    let mut options = RunOptions::default();
    options.include.insert("ghost".into());
    let engine = Engine::new(schema, vec![copy_generator()], options);
    let err = engine.run(&mut db, &mut meta).unwrap_err();
    assert!(matches!(err, EngineError::UnknownGenerator(name) if name == "ghost"));
}

#[test]
fn excluded_generators_are_reported_as_filtered() {
    let schema = fk_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);
    db.execute("INSERT INTO other_obj (other_obj_id, other_attr) VALUES (0, 'cat')")
        .unwrap();

    let mut options = RunOptions::default();
    options.include.insert("row_one".into());
    let engine = Engine::new(
        schema,
        vec![row_generator("row_one", 1, 0), row_generator("row_two", 2, 0)],
        options,
    );
    let report = engine.run(&mut db, &mut meta).unwrap();
    assert!(matches!(
        report.statuses["row_one"],
        GeneratorStatus::Completed { .. }
    ));
    assert_eq!(report.statuses["row_two"], GeneratorStatus::Filtered);

    let batch = db.query("SELECT COUNT(*) FROM my_obj").unwrap();
    assert_eq!(batch.rows[0][0], Value::Int(1));
}

#[test]
fn reset_schema_drops_existing_data() {
    let schema = copy_schema();
    let (mut db, mut meta) = stores();
    apply_ddl(&mut db, &schema);
    db.execute("INSERT INTO copy (copy_id, label) VALUES (1, 'stale')")
        .unwrap();

    let good = Generator::new("fresh").load(
        Load::insert("copy").set("label", ValueSource::Const(Value::Text("new".into()))),
    );
    let mut options = RunOptions::default();
    options.reset_schema = true;
    let engine = Engine::new(schema, vec![good], options);
    engine.run(&mut db, &mut meta).unwrap();

    let batch = db.query("SELECT label FROM copy").unwrap();
    assert_eq!(batch.rows, vec![vec![Value::Text("new".into())]]);
}
