//! Scheduling driven by inferred footprints of real queries and loads.

use weir::algebra::Path;
use weir::generator::Generator;
use weir::load::{Load, RelSource, ValueSource};
use weir::model::{Attr, AttrType, Entity, OnDelete, Rel, Schema};
use weir::query::{col, count, Expr, Query};
use weir::schedule::{plan, ScheduleError};
use weir::value::Value;

fn pet_schema() -> Schema {
    let person = Entity::new(
        "person",
        vec![Attr::new("name", AttrType::Text).identifying()],
        vec![],
    )
    .unwrap();
    let pet = Entity::new(
        "pet",
        vec![Attr::new("tag", AttrType::Int).identifying()],
        vec![Rel::new("owner", "pet", "person", true, OnDelete::Cascade)],
    )
    .unwrap();
    Schema::new(vec![person, pet]).unwrap()
}

fn seed_people() -> Generator {
    Generator::new("seed_people").load(
        Load::insert("person").set("name", ValueSource::Const(Value::Text("ann".into()))),
    )
}

fn give_pets() -> Generator {
    let query = Query::new()
        .with_basis("person")
        .select("name", col(Path::to("person").attr("name")));
    Generator::new("give_pets").with_query(query).load(
        Load::insert("pet")
            .set("tag", ValueSource::Const(Value::Int(1)))
            .rel(
                "owner",
                RelSource::Key(ValueSource::Query {
                    column: "person__key".into(),
                }),
            ),
    )
}

#[test]
fn inferred_footprints_order_producer_first() {
    let schema = pet_schema();
    // Lexicographically give_pets sorts first; the inferred dependency on
    // the person table must override that.
    let ordered = plan(&schema, &[give_pets(), seed_people()]).unwrap();
    assert_eq!(
        ordered.order,
        vec!["seed_people".to_string(), "give_pets".to_string()]
    );

    let seed_dep = &ordered.deps["seed_people"];
    assert!(seed_dep.tables_yielded.contains("person"));
    let pets_dep = &ordered.deps["give_pets"];
    assert!(pets_dep.tables_needed.contains("person"));
    assert!(pets_dep.tables_yielded.contains("pet"));
}

#[test]
fn independent_generators_keep_name_order() {
    let schema = pet_schema();
    let a = Generator::new("zeta").load(
        Load::insert("person").set("name", ValueSource::Const(Value::Text("x".into()))),
    );
    let b = Generator::new("alpha").load(
        Load::insert("person").set("name", ValueSource::Const(Value::Text("y".into()))),
    );
    // Both yield person and neither reads it, so no edge exists.
    let ordered = plan(&schema, &[a, b]).unwrap();
    assert_eq!(ordered.order, vec!["alpha".to_string(), "zeta".to_string()]);
}

#[test]
fn subquery_reads_create_scheduling_edges() {
    let schema = pet_schema();
    let counting = Query::new().with_basis("person").select(
        "n",
        Expr::Subquery(Box::new(
            Query::new()
                .with_basis("pet")
                .select("n", count(col(Path::to("pet").attr("tag")))),
        )),
    );
    // "a_count" sorts first lexicographically; the table it reads only
    // through the subquery must still order its producer first.
    let consumer = Generator::new("a_count").with_query(counting);
    let ordered = plan(&schema, &[consumer, give_pets(), seed_people()]).unwrap();
    assert_eq!(
        ordered.order,
        vec![
            "seed_people".to_string(),
            "give_pets".to_string(),
            "a_count".to_string(),
        ]
    );
    assert!(ordered.deps["a_count"].tables_needed.contains("pet"));
    assert!(ordered.deps["a_count"].columns_needed.contains("pet.tag"));
}

#[test]
fn query_over_own_output_is_not_a_cycle() {
    let schema = pet_schema();
    let query = Query::new()
        .with_basis("person")
        .select("name", col(Path::to("person").attr("name")));
    let gen = Generator::new("rename").with_query(query).load(
        Load::insert("person").set(
            "name",
            ValueSource::Query {
                column: "name".into(),
            },
        ),
    );
    let ordered = plan(&schema, &[gen]).unwrap();
    assert_eq!(ordered.order, vec!["rename".to_string()]);
}

#[test]
fn mutual_reads_report_a_cycle_with_names() {
    let schema = pet_schema();

    let person_query = Query::new()
        .with_basis("person")
        .select("name", col(Path::to("person").attr("name")));
    let pet_query = Query::new()
        .with_basis("pet")
        .select("tag", col(Path::to("pet").attr("tag")));

    // a reads pet and writes person; b reads person and writes pet.
    let a = Generator::new("a").with_query(pet_query).load(
        Load::insert("person").set("name", ValueSource::Const(Value::Text("x".into()))),
    );
    let b = Generator::new("b").with_query(person_query).load(
        Load::insert("pet")
            .set("tag", ValueSource::Const(Value::Int(1)))
            .rel(
                "owner",
                RelSource::Key(ValueSource::Query {
                    column: "person__key".into(),
                }),
            ),
    );

    match plan(&schema, &[a, b]).unwrap_err() {
        ScheduleError::Cycle(names) => {
            assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn duplicate_names_rejected() {
    let schema = pet_schema();
    let err = plan(&schema, &[seed_people(), seed_people()]).unwrap_err();
    assert!(matches!(err, ScheduleError::DuplicateGenerator(name) if name == "seed_people"));
}

#[test]
fn unpopulated_tables_produce_warnings() {
    let schema = pet_schema();
    let ordered = plan(&schema, &[seed_people()]).unwrap();
    assert!(ordered
        .warnings
        .iter()
        .any(|w| w.contains("table 'pet'")));
    assert!(ordered
        .warnings
        .iter()
        .any(|w| w.contains("pet.tag")));
}
