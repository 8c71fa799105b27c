//! Loader behavior against a live database: broadcasting, merge
//! convergence and foreign-key recovery.

use weir::db::{Database, SqliteDb};
use weir::load::{Load, LoadError, RelSource, ValueSource};
use weir::loader::{ColumnResolver, Loader};
use weir::model::{Attr, AttrType, Entity, OnDelete, Rel, Schema};
use weir::value::Value;

fn pet_schema() -> Schema {
    let person = Entity::new(
        "person",
        vec![
            Attr::new("name", AttrType::Text).identifying(),
            Attr::new("age", AttrType::Int),
        ],
        vec![],
    )
    .unwrap();
    let pet = Entity::new(
        "pet",
        vec![
            Attr::new("tag", AttrType::Int).identifying(),
            Attr::new("color", AttrType::Text),
        ],
        vec![Rel::new("owner", "pet", "person", true, OnDelete::Cascade)],
    )
    .unwrap();
    Schema::new(vec![person, pet]).unwrap()
}

fn target(schema: &Schema) -> SqliteDb {
    let mut db = SqliteDb::open_in_memory().unwrap();
    for statement in schema.ddl() {
        db.execute(&statement).unwrap();
    }
    db
}

fn text(s: &str) -> Value {
    Value::Text(s.into())
}

#[test]
fn constants_broadcast_to_the_batch_length() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    let mut resolver = ColumnResolver::new();
    resolver.insert("names", vec![text("ann"), text("bob"), text("cat")]);
    let load = Load::insert("person")
        .set("name", ValueSource::Query { column: "names".into() })
        .set("age", ValueSource::Const(Value::Int(30)));

    let keys = loader.load(&mut db, &load, &resolver).unwrap();
    assert_eq!(keys.len(), 3);

    let batch = db.query("SELECT COUNT(*) FROM person WHERE age = 30").unwrap();
    assert_eq!(batch.rows[0][0], Value::Int(3));
}

#[test]
fn mismatched_column_lengths_are_rejected() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    let mut resolver = ColumnResolver::new();
    resolver.insert("names", vec![text("ann"), text("bob")]);
    resolver.insert("ages", vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    let load = Load::insert("person")
        .set("name", ValueSource::Query { column: "names".into() })
        .set("age", ValueSource::Query { column: "ages".into() });

    // Columns broadcast in name order, so "ages" fixes the length first.
    let err = loader.load(&mut db, &load, &resolver).unwrap_err();
    assert!(matches!(err, LoadError::BroadcastMismatch(3, 2)));
    // Nothing was staged or merged.
    let batch = db.query("SELECT COUNT(*) FROM person").unwrap();
    assert_eq!(batch.rows[0][0], Value::Int(0));
}

#[test]
fn empty_batch_is_a_no_op() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    let mut resolver = ColumnResolver::new();
    resolver.insert("names", vec![]);
    let load =
        Load::insert("person").set("name", ValueSource::Query { column: "names".into() });

    let keys = loader.load(&mut db, &load, &resolver).unwrap();
    assert!(keys.is_empty());
    let batch = db.query("SELECT COUNT(*) FROM person").unwrap();
    assert_eq!(batch.rows[0][0], Value::Int(0));
}

#[test]
fn reload_with_new_values_updates_in_place() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    let mut resolver = ColumnResolver::new();
    resolver.insert("names", vec![text("ann")]);

    let aged = |age: i64| {
        Load::insert("person")
            .set("name", ValueSource::Query { column: "names".into() })
            .set("age", ValueSource::Const(Value::Int(age)))
    };

    let first = loader.load(&mut db, &aged(30), &resolver).unwrap();
    let second = loader.load(&mut db, &aged(31), &resolver).unwrap();
    // Same identity, same synthetic key; the reload rewrites the
    // non-identifying column instead of adding a row.
    assert_eq!(first, second);

    let batch = db.query("SELECT age FROM person").unwrap();
    assert_eq!(batch.rows.len(), 1);
    assert_eq!(batch.rows[0][0], Value::Int(31));
}

#[test]
fn update_by_identity_locates_without_rewriting_it() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    let mut resolver = ColumnResolver::new();
    resolver.insert("names", vec![text("ann")]);
    loader
        .load(
            &mut db,
            &Load::insert("person")
                .set("name", ValueSource::Query { column: "names".into() })
                .set("age", ValueSource::Const(Value::Int(30))),
            &resolver,
        )
        .unwrap();

    // The identifying column locates the row; only age is written.
    let update = Load::update("person")
        .set("name", ValueSource::Query { column: "names".into() })
        .set("age", ValueSource::Const(Value::Int(31)));
    loader.load(&mut db, &update, &resolver).unwrap();

    let batch = db.query("SELECT name, age FROM person").unwrap();
    assert_eq!(batch.rows, vec![vec![text("ann"), Value::Int(31)]]);
}

#[test]
fn fk_recovery_keeps_valid_rows() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    // One real owner.
    let mut resolver = ColumnResolver::new();
    resolver.insert("names", vec![text("ann")]);
    let owner_keys = loader
        .load(
            &mut db,
            &Load::insert("person").set("name", ValueSource::Query { column: "names".into() }),
            &resolver,
        )
        .unwrap();

    // Two pets reference the real owner, one references a ghost.
    resolver.insert("tags", vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    resolver.insert(
        "owner_keys",
        vec![
            owner_keys[0].clone(),
            text("no-such-person"),
            owner_keys[0].clone(),
        ],
    );
    let load = Load::insert("pet")
        .set("tag", ValueSource::Query { column: "tags".into() })
        .rel(
            "owner",
            RelSource::Key(ValueSource::Query { column: "owner_keys".into() }),
        );

    loader.load(&mut db, &load, &resolver).unwrap();

    let batch = db.query("SELECT tag FROM pet ORDER BY tag").unwrap();
    assert_eq!(batch.rows.len(), 2);
    assert_eq!(batch.rows[0][0], Value::Int(1));
    assert_eq!(batch.rows[1][0], Value::Int(3));
}

#[test]
fn nested_singleton_parent_broadcasts_over_children() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    let mut resolver = ColumnResolver::new();
    resolver.insert("tags", vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    let load = Load::insert("pet")
        .set("tag", ValueSource::Query { column: "tags".into() })
        .rel(
            "owner",
            RelSource::Nested(
                Load::insert("person").set("name", ValueSource::Const(text("ann"))),
            ),
        );

    loader.load(&mut db, &load, &resolver).unwrap();

    let people = db.query("SELECT COUNT(*) FROM person").unwrap();
    assert_eq!(people.rows[0][0], Value::Int(1));
    let pets = db
        .query("SELECT COUNT(DISTINCT owner) FROM pet")
        .unwrap();
    assert_eq!(pets.rows[0][0], Value::Int(1));
}

#[test]
fn missing_source_column_is_reported() {
    let schema = pet_schema();
    let mut db = target(&schema);
    let loader = Loader::new(&schema);

    let resolver = ColumnResolver::new();
    let load =
        Load::insert("person").set("name", ValueSource::Query { column: "ghost".into() });

    let err = loader.load(&mut db, &load, &resolver).unwrap_err();
    assert!(matches!(err, LoadError::UnknownSource(column) if column == "ghost"));
}
