//! Query compilation: rendered SQL shape and live execution.

use weir::algebra::Path;
use weir::db::{Database, SqliteDb};
use weir::model::{Attr, AttrType, Entity, OnDelete, Rel, Schema};
use weir::query::{col, count, lit, Query, QueryError};
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

fn seeded_db(schema: &Schema) -> SqliteDb {
    let mut db = SqliteDb::open_in_memory().unwrap();
    for statement in schema.ddl() {
        db.execute(&statement).unwrap();
    }
    db.execute("INSERT INTO person (person_id, name, age) VALUES (1, 'ann', 40)")
        .unwrap();
    db.execute("INSERT INTO person (person_id, name, age) VALUES (2, 'bob', 35)")
        .unwrap();
    db.execute("INSERT INTO pet (pet_id, tag, color, owner) VALUES (10, 7, 'red', 1)")
        .unwrap();
    db.execute("INSERT INTO pet (pet_id, tag, color, owner) VALUES (11, 8, 'blue', 2)")
        .unwrap();
    db
}

#[test]
fn compiled_query_carries_keys_identity_and_guards() {
    let schema = pet_schema();
    let query = Query::new().select(
        "owner_name",
        col(Path::via(&schema, "pet", &["owner"]).unwrap().attr("name")),
    );
    let compiled = query.compile(&schema).unwrap();

    assert!(compiled.sql.contains("pet.pet_id AS pet__key"));
    assert!(compiled.sql.contains("AS pet__identity"));
    assert!(compiled.sql.contains("INNER JOIN person"));
    assert!(compiled.sql.contains("IS NOT NULL"));
    assert!(compiled.sql.contains("COALESCE(pet._removed, 0) = 0"));
    assert_eq!(
        compiled.columns,
        vec!["pet__key", "pet__identity", "owner_name"]
    );
    assert_eq!(compiled.basis.iter().next().map(|s| s.as_str()), Some("pet"));
}

#[test]
fn compiled_query_runs_and_excludes_soft_deleted_rows() {
    let schema = pet_schema();
    let mut db = seeded_db(&schema);

    let query = Query::new().select(
        "owner_name",
        col(Path::via(&schema, "pet", &["owner"]).unwrap().attr("name")),
    );
    let compiled = query.compile(&schema).unwrap();

    let batch = db
        .query(&format!("SELECT * FROM ({}) ORDER BY pet__key", compiled.sql))
        .unwrap();
    assert_eq!(batch.rows.len(), 2);
    let name_ix = batch.column_index("owner_name").unwrap();
    assert_eq!(batch.rows[0][name_ix], Value::Text("ann".into()));
    assert_eq!(batch.rows[1][name_ix], Value::Text("bob".into()));

    // Soft-delete the owner: the join guard removes the pet row too.
    db.execute("UPDATE person SET _removed = 1 WHERE person_id = 2")
        .unwrap();
    let batch = db.query(&compiled.sql).unwrap();
    assert_eq!(batch.rows.len(), 1);
}

#[test]
fn aggregates_group_by_the_bare_primary_key() {
    let schema = pet_schema();
    let query = Query::new()
        .with_basis("person")
        .select("name", col(Path::to("person").attr("name")))
        .select("pets", count(lit(1)));
    let compiled = query.compile(&schema).unwrap();

    assert!(compiled.sql.contains("GROUP BY"));
    // Identity is MAX-wrapped under grouping, and the group key is the
    // raw pk, not the identity expression.
    assert!(compiled.sql.contains("MAX((person.person_id"));
    assert!(compiled.sql.contains("GROUP BY person.person_id"));
}

#[test]
fn aggregate_query_executes() {
    let schema = pet_schema();
    let mut db = seeded_db(&schema);
    db.execute("INSERT INTO pet (pet_id, tag, color, owner) VALUES (12, 9, 'red', 1)")
        .unwrap();

    // Walk the owner relation in reverse: person as basis, pets fanned out.
    let query = Query::new()
        .with_basis("person")
        .select("name", col(Path::to("person").attr("name")))
        .select(
            "pets",
            count(col(
                Path::via(&schema, "person", &["owner"]).unwrap().attr("tag"),
            )),
        );
    let compiled = query.compile(&schema).unwrap();

    let batch = db
        .query(&format!(
            "SELECT name, pets FROM ({}) ORDER BY name",
            compiled.sql
        ))
        .unwrap();
    assert_eq!(batch.rows.len(), 2);
    assert_eq!(batch.rows[0], vec![Value::Text("ann".into()), Value::Int(2)]);
    assert_eq!(batch.rows[1], vec![Value::Text("bob".into()), Value::Int(1)]);
}

#[test]
fn nullable_exemption_lifts_the_not_null_guard() {
    let schema = pet_schema();

    let guarded = Query::new()
        .with_basis("pet")
        .select("color", col(Path::to("pet").attr("color")))
        .compile(&schema)
        .unwrap();
    assert!(guarded.sql.contains("pet.color IS NOT NULL"));

    let lifted = Query::new()
        .with_basis("pet")
        .select("color", col(Path::to("pet").attr("color")))
        .nullable("pet.color")
        .compile(&schema)
        .unwrap();
    assert!(!lifted.sql.contains("pet.color IS NOT NULL"));
}

#[test]
fn optional_relation_renders_left_join() {
    let schema = pet_schema();
    let query = Query::new()
        .with_basis("pet")
        .select(
            "owner_name",
            col(Path::via(&schema, "pet", &["owner"]).unwrap().attr("name")),
        )
        .nullable("person.name")
        .optional_rel("owner");
    let compiled = query.compile(&schema).unwrap();
    assert!(compiled.sql.contains("LEFT JOIN person"));
}

#[test]
fn ambiguous_basis_is_a_compile_error() {
    let schema = pet_schema();
    let query = Query::new()
        .select("color", col(Path::to("pet").attr("color")))
        .select("name", col(Path::to("person").attr("name")));
    match query.compile(&schema) {
        Err(QueryError::AmbiguousBasis(entities)) => {
            assert_eq!(entities.len(), 2);
        }
        other => panic!("expected ambiguous basis, got {:?}", other.map(|c| c.sql)),
    }
}

#[test]
fn predicate_filters_and_hash_is_stable() {
    let schema = pet_schema();
    let mut db = seeded_db(&schema);

    let build = || {
        Query::new()
            .with_basis("pet")
            .select("tag", col(Path::to("pet").attr("tag")))
            .filter(col(Path::to("pet").attr("color")).eq(lit("red")))
    };
    let compiled = build().compile(&schema).unwrap();
    assert_eq!(compiled.hash, build().compile(&schema).unwrap().hash);

    let batch = db.query(&compiled.sql).unwrap();
    assert_eq!(batch.rows.len(), 1);
    let tag_ix = batch.column_index("tag").unwrap();
    assert_eq!(batch.rows[0][tag_ix], Value::Int(7));
}
