//! End-to-end shape tests over the commerce fixture schema: collected
//! record sets are ordered, remap-planned, and rendered, and the resulting
//! stream is checked for closure, determinism, and cycle handling.

use std::collections::{BTreeMap, BTreeSet};

use pg_subset_dump::dump::{
    build_pk_map, topo_sort, DdlGenerator, GenerateOptions, PkMap, SqlGenerator,
};
use pg_subset_dump::graph::{PkValue, RawValue, RecordData, RecordIdentifier};
use pg_subset_dump::schema::{Column, ForeignKey, SchemaGraph, Table, TableRef};

// ---------------------------------------------------------------------------
// Fixture schema
// ---------------------------------------------------------------------------

fn col(name: &str, udt: &str, identity: bool) -> Column {
    let data_type = match udt {
        "int4" => "integer",
        "text" => "text",
        "timestamp" => "timestamp without time zone",
        "numeric" => "numeric",
        other => other,
    };
    Column {
        name: name.to_string(),
        ordinal: 0,
        data_type: data_type.to_string(),
        udt_name: udt.to_string(),
        nullable: !identity,
        default_expr: None,
        is_identity: identity,
    }
}

fn fk(name: &str, from: &str, from_cols: &[&str], to: &str, to_cols: &[&str]) -> ForeignKey {
    ForeignKey {
        name: name.to_string(),
        from_table: TableRef::new("public", from),
        from_columns: from_cols.iter().map(|c| c.to_string()).collect(),
        to_table: TableRef::new("public", to),
        to_columns: to_cols.iter().map(|c| c.to_string()).collect(),
        on_delete: "NO ACTION".to_string(),
    }
}

fn table(name: &str, columns: Vec<Column>, pk: &[&str], outgoing: Vec<ForeignKey>) -> Table {
    Table {
        table_ref: TableRef::new("public", name),
        columns,
        primary_key: pk.iter().map(|c| c.to_string()).collect(),
        unique_constraints: vec![],
        outgoing_fks: outgoing,
        incoming_fks: vec![],
    }
}

/// The commerce fixture: roles, users (role + self-referencing manager),
/// categories (self-referencing parent), products, orders, order_items,
/// banks, bank_accounts, transactions, user_groups.
fn fixture_graph() -> SchemaGraph {
    let mut graph = SchemaGraph::new();
    graph.insert(table(
        "roles",
        vec![col("id", "int4", true), col("name", "text", false)],
        &["id"],
        vec![],
    ));
    graph.insert(table(
        "users",
        vec![
            col("id", "int4", true),
            col("role_id", "int4", false),
            col("manager_id", "int4", false),
            col("name", "text", false),
        ],
        &["id"],
        vec![
            fk("users_role_id_fkey", "users", &["role_id"], "roles", &["id"]),
            fk("users_manager_id_fkey", "users", &["manager_id"], "users", &["id"]),
        ],
    ));
    graph.insert(table(
        "groups",
        vec![col("id", "int4", true), col("name", "text", false)],
        &["id"],
        vec![],
    ));
    graph.insert(table(
        "user_groups",
        vec![col("user_id", "int4", false), col("group_id", "int4", false)],
        &["user_id", "group_id"],
        vec![
            fk("user_groups_user_id_fkey", "user_groups", &["user_id"], "users", &["id"]),
            fk("user_groups_group_id_fkey", "user_groups", &["group_id"], "groups", &["id"]),
        ],
    ));
    graph.insert(table(
        "categories",
        vec![
            col("id", "int4", true),
            col("parent_id", "int4", false),
            col("name", "text", false),
        ],
        &["id"],
        vec![fk(
            "categories_parent_id_fkey",
            "categories",
            &["parent_id"],
            "categories",
            &["id"],
        )],
    ));
    graph.insert(table(
        "products",
        vec![
            col("id", "int4", true),
            col("category_id", "int4", false),
            col("name", "text", false),
        ],
        &["id"],
        vec![fk(
            "products_category_id_fkey",
            "products",
            &["category_id"],
            "categories",
            &["id"],
        )],
    ));
    graph.insert(table(
        "orders",
        vec![
            col("id", "int4", true),
            col("user_id", "int4", false),
            col("created_at", "timestamp", false),
        ],
        &["id"],
        vec![fk("orders_user_id_fkey", "orders", &["user_id"], "users", &["id"])],
    ));
    graph.insert(table(
        "order_items",
        vec![
            col("id", "int4", true),
            col("order_id", "int4", false),
            col("product_id", "int4", false),
        ],
        &["id"],
        vec![
            fk("order_items_order_id_fkey", "order_items", &["order_id"], "orders", &["id"]),
            fk(
                "order_items_product_id_fkey",
                "order_items",
                &["product_id"],
                "products",
                &["id"],
            ),
        ],
    ));
    graph.insert(table(
        "banks",
        vec![col("id", "int4", true), col("name", "text", false)],
        &["id"],
        vec![],
    ));
    graph.insert(table(
        "bank_accounts",
        vec![
            col("id", "int4", true),
            col("user_id", "int4", false),
            col("bank_id", "int4", false),
        ],
        &["id"],
        vec![
            fk("bank_accounts_user_id_fkey", "bank_accounts", &["user_id"], "users", &["id"]),
            fk("bank_accounts_bank_id_fkey", "bank_accounts", &["bank_id"], "banks", &["id"]),
        ],
    ));
    graph.insert(table(
        "transactions",
        vec![
            col("id", "int4", true),
            col("bank_account_id", "int4", false),
            col("amount", "numeric", false),
            col("created_at", "timestamp", false),
        ],
        &["id"],
        vec![fk(
            "transactions_bank_account_id_fkey",
            "transactions",
            &["bank_account_id"],
            "bank_accounts",
            &["id"],
        )],
    ));
    graph
}

// ---------------------------------------------------------------------------
// Record construction helpers
// ---------------------------------------------------------------------------

fn ident(table: &str, pk: i64) -> RecordIdentifier {
    RecordIdentifier::new(TableRef::new("public", table), vec![PkValue::Int(pk)])
}

struct RecordSet {
    records: BTreeMap<RecordIdentifier, RecordData>,
}

impl RecordSet {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    fn add(
        &mut self,
        id: RecordIdentifier,
        values: Vec<(&str, RawValue)>,
        deps: Vec<RecordIdentifier>,
    ) {
        let mut record = RecordData::new(
            id.clone(),
            values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        );
        record.dependencies.extend(deps);
        self.records.insert(id, record);
    }
}

fn int(v: i64) -> RawValue {
    RawValue::I32(v as i32)
}

fn text(v: &str) -> RawValue {
    RawValue::Text(v.to_string())
}

/// The record set a strict traversal of users(3) collects: the user, its
/// role and manager, one order with one item, the product and category
/// chain, one bank account with two transactions.
fn strict_user3_records() -> RecordSet {
    let mut set = RecordSet::new();
    set.add(
        ident("roles", 2),
        vec![("id", int(2)), ("name", text("staff"))],
        vec![],
    );
    set.add(
        ident("users", 2),
        vec![
            ("id", int(2)),
            ("role_id", int(2)),
            ("manager_id", RawValue::Null),
            ("name", text("Morgan")),
        ],
        vec![ident("roles", 2)],
    );
    set.add(
        ident("users", 3),
        vec![
            ("id", int(3)),
            ("role_id", int(2)),
            ("manager_id", int(2)),
            ("name", text("Carol")),
        ],
        vec![ident("roles", 2), ident("users", 2)],
    );
    set.add(
        ident("categories", 1),
        vec![
            ("id", int(1)),
            ("parent_id", RawValue::Null),
            ("name", text("tools")),
        ],
        vec![],
    );
    set.add(
        ident("products", 5),
        vec![("id", int(5)), ("category_id", int(1)), ("name", text("wrench"))],
        vec![ident("categories", 1)],
    );
    set.add(
        ident("orders", 40),
        vec![
            ("id", int(40)),
            ("user_id", int(3)),
            ("created_at", RawValue::Null),
        ],
        vec![ident("users", 3)],
    );
    set.add(
        ident("order_items", 400),
        vec![("id", int(400)), ("order_id", int(40)), ("product_id", int(5))],
        vec![ident("orders", 40), ident("products", 5)],
    );
    set.add(
        ident("banks", 7),
        vec![("id", int(7)), ("name", text("First"))],
        vec![],
    );
    set.add(
        ident("bank_accounts", 70),
        vec![("id", int(70)), ("user_id", int(3)), ("bank_id", int(7))],
        vec![ident("users", 3), ident("banks", 7)],
    );
    set.add(
        ident("transactions", 700),
        vec![
            ("id", int(700)),
            ("bank_account_id", int(70)),
            ("amount", RawValue::Decimal("10.50".parse().unwrap())),
            ("created_at", RawValue::Null),
        ],
        vec![ident("bank_accounts", 70)],
    );
    set.add(
        ident("transactions", 701),
        vec![
            ("id", int(701)),
            ("bank_account_id", int(70)),
            ("amount", RawValue::Decimal("3.25".parse().unwrap())),
            ("created_at", RawValue::Null),
        ],
        vec![ident("bank_accounts", 70)],
    );
    set
}

fn generate(
    records: &BTreeMap<RecordIdentifier, RecordData>,
    graph: &SchemaGraph,
    keep_pks: bool,
) -> String {
    let outcome = topo_sort(records);
    let pk_map = if keep_pks {
        PkMap::new()
    } else {
        build_pk_map(records, graph, &outcome.cycle_members).unwrap()
    };
    SqlGenerator::new(graph)
        .generate(
            &outcome.ordered,
            records,
            &pk_map,
            &outcome.cycle_members,
            None,
            &GenerateOptions {
                keep_pks,
                include_transaction: true,
            },
        )
        .unwrap()
}

/// Strip the generation timestamp so streams can be compared.
fn without_date(sql: &str) -> String {
    sql.lines()
        .filter(|l| !l.starts_with("-- Date:"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn closure_every_dependency_precedes_its_dependent() {
    let set = strict_user3_records();
    let outcome = topo_sort(&set.records);

    assert_eq!(outcome.ordered.len(), set.records.len());
    assert!(!outcome.has_cycles());

    let mut seen: BTreeSet<&RecordIdentifier> = BTreeSet::new();
    for id in &outcome.ordered {
        for dep in &set.records[id].dependencies {
            assert!(
                seen.contains(dep),
                "{} emitted before its dependency {}",
                id,
                dep
            );
        }
        seen.insert(id);
    }
}

#[test]
fn strict_stream_contains_expected_tables_in_order() {
    let graph = fixture_graph();
    let set = strict_user3_records();
    let sql = generate(&set.records, &graph, true);

    let pos = |needle: &str| sql.find(needle).unwrap_or_else(|| panic!("missing {}", needle));

    // Dependencies come earlier in the stream.
    assert!(pos("\"roles\"") < pos("\"users\""));
    assert!(pos("\"users\"") < pos("\"orders\""));
    assert!(pos("\"orders\"") < pos("\"order_items\""));
    assert!(pos("\"categories\"") < pos("\"products\""));
    assert!(pos("\"products\"") < pos("\"order_items\""));
    assert!(pos("\"banks\"") < pos("\"bank_accounts\""));
    assert!(pos("\"bank_accounts\"") < pos("\"transactions\""));

    // Both transactions made it, and nothing else from that table.
    assert!(sql.contains("(700, 70, 10.50, NULL)"));
    assert!(sql.contains("(701, 70, 3.25, NULL)"));
}

#[test]
fn shared_parent_emitted_exactly_once() {
    let graph = fixture_graph();
    let mut set = strict_user3_records();
    // A second seed sharing role 2 and manager 2.
    set.add(
        ident("users", 4),
        vec![
            ("id", int(4)),
            ("role_id", int(2)),
            ("manager_id", int(2)),
            ("name", text("Dana")),
        ],
        vec![ident("roles", 2), ident("users", 2)],
    );

    let sql = generate(&set.records, &graph, true);
    assert_eq!(sql.matches("'staff'").count(), 1);
    assert_eq!(sql.matches("'Morgan'").count(), 1);
}

#[test]
fn category_cycle_is_emitted_inside_deferred_block() {
    let graph = fixture_graph();
    let mut set = RecordSet::new();
    set.add(
        ident("categories", 10),
        vec![("id", int(10)), ("parent_id", int(11)), ("name", text("a"))],
        vec![ident("categories", 11)],
    );
    set.add(
        ident("categories", 11),
        vec![("id", int(11)), ("parent_id", int(10)), ("name", text("b"))],
        vec![ident("categories", 10)],
    );
    set.add(
        ident("products", 5),
        vec![("id", int(5)), ("category_id", int(10)), ("name", text("x"))],
        vec![ident("categories", 10)],
    );

    let outcome = topo_sort(&set.records);
    assert!(outcome.has_cycles());
    // Both categories emitted, and the product after its category.
    assert_eq!(outcome.ordered.len(), 3);
    let cat_pos = outcome
        .ordered
        .iter()
        .position(|id| *id == ident("categories", 10))
        .unwrap();
    let product_pos = outcome
        .ordered
        .iter()
        .position(|id| *id == ident("products", 5))
        .unwrap();
    assert!(cat_pos < product_pos);

    let sql = generate(&set.records, &graph, true);
    let begin = sql.find("BEGIN;").unwrap();
    let deferred = sql.find("SET CONSTRAINTS ALL DEFERRED;").unwrap();
    let first_insert = sql.find("INSERT INTO").unwrap();
    assert!(begin < deferred && deferred < first_insert);
}

#[test]
fn remap_of_cycle_member_fails() {
    let graph = fixture_graph();
    let mut set = RecordSet::new();
    set.add(
        ident("categories", 10),
        vec![("id", int(10)), ("parent_id", int(11)), ("name", text("a"))],
        vec![ident("categories", 11)],
    );
    set.add(
        ident("categories", 11),
        vec![("id", int(11)), ("parent_id", int(10)), ("name", text("b"))],
        vec![ident("categories", 10)],
    );

    let outcome = topo_sort(&set.records);
    let err = build_pk_map(&set.records, &graph, &outcome.cycle_members).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn remapped_stream_resolves_references_through_map() {
    let graph = fixture_graph();
    let set = strict_user3_records();
    let sql = generate(&set.records, &graph, false);

    // All fixture tables have identity keys, so everything remaps.
    assert!(sql.contains("DO $$"));
    assert!(sql.contains("CREATE TEMP TABLE IF NOT EXISTS _pg_subset_pk_map"));
    // The order's user reference goes through the map, not a literal.
    assert!(sql.contains(
        "(SELECT new_pk::integer FROM _pg_subset_pk_map WHERE table_name = '\"public\".\"users\"' AND old_pk = '3')"
    ));
    // Identity key columns are never inserted literally.
    assert!(sql.contains("INSERT INTO \"public\".\"roles\" (\"name\")"));
    assert!(!sql.contains("INSERT INTO \"public\".\"roles\" (\"id\""));
}

#[test]
fn composite_key_rows_keep_literal_keys_in_remap_mode() {
    let graph = fixture_graph();
    let mut set = strict_user3_records();
    set.add(
        ident("groups", 9),
        vec![("id", int(9)), ("name", text("ops"))],
        vec![],
    );
    let ug = RecordIdentifier::new(
        TableRef::new("public", "user_groups"),
        vec![PkValue::Int(3), PkValue::Int(9)],
    );
    set.add(
        ug,
        vec![("user_id", int(3)), ("group_id", int(9))],
        vec![ident("users", 3), ident("groups", 9)],
    );

    let sql = generate(&set.records, &graph, false);
    // user_groups has a composite key: inserted with columns intact, but
    // its references still resolve through the map.
    assert!(sql.contains("INSERT INTO \"public\".\"user_groups\" (\"user_id\", \"group_id\")"));
    assert!(sql.contains("old_pk = '9'"));
}

#[test]
fn streams_are_deterministic() {
    let graph = fixture_graph();
    let set = strict_user3_records();
    let a = generate(&set.records, &graph, true);
    let b = generate(&set.records, &graph, true);
    assert_eq!(without_date(&a), without_date(&b));

    let c = generate(&set.records, &graph, false);
    let d = generate(&set.records, &graph, false);
    assert_eq!(without_date(&c), without_date(&d));
}

#[test]
fn ddl_prelude_orders_tables_and_defers_self_references() {
    let graph = fixture_graph();
    let tables: BTreeSet<TableRef> = strict_user3_records()
        .records
        .keys()
        .map(|id| id.table.clone())
        .collect();
    let ddl = DdlGenerator::new(&graph).generate("app", &tables);

    assert!(ddl.contains("CREATE DATABASE \"app\";"));
    assert!(ddl.contains("CREATE SCHEMA IF NOT EXISTS \"public\";"));

    let pos = |needle: &str| ddl.find(needle).unwrap_or_else(|| panic!("missing {}", needle));
    assert!(
        pos("CREATE TABLE IF NOT EXISTS \"public\".\"roles\"")
            < pos("CREATE TABLE IF NOT EXISTS \"public\".\"users\"")
    );
    assert!(
        pos("CREATE TABLE IF NOT EXISTS \"public\".\"users\"")
            < pos("CREATE TABLE IF NOT EXISTS \"public\".\"orders\"")
    );
    // The self-referencing manager constraint is added afterwards.
    assert!(ddl.contains("ADD CONSTRAINT \"users_manager_id_fkey\""));
}
