//! Integration tests for the staged table refactor.
//!
//! `movements.section` (enum movement_section) becomes `movements.role`
//! (enum movement_role) through the six staging phases, while
//! `session_exercises` keeps referencing `movements`.

use chrono::{DateTime, Utc};
use revchain_core::migration::{
    MigrationConfig, MigrationError, Migrator, SchemaState, StagePhase, StagedRefactor, Target,
};
use revchain_core::revision::{Operation, OperationSet, RevisionUnit};
use revchain_core::schema::{
    row_key, ColumnDef, ColumnType, Database, EmbeddedDatabase, Expr, ForeignKeyDef, Row,
    SchemaSnapshot, TableDef,
};
use serde_json::json;

const SESSION_FK: &str = "session_exercises_movement_id_fkey";
const ROWS: i64 = 100;

fn movements_v1() -> TableDef {
    TableDef::new("movements", "id")
        .with_column(ColumnDef::required("id", ColumnType::Integer))
        .with_column(ColumnDef::required("name", ColumnType::Text))
        .with_column(ColumnDef::new("section", ColumnType::enumeration("movement_section")))
}

fn movements_v2() -> TableDef {
    TableDef::new("movements", "id")
        .with_column(ColumnDef::required("id", ColumnType::Integer))
        .with_column(ColumnDef::required("name", ColumnType::Text))
        .with_column(ColumnDef::new("role", ColumnType::enumeration("movement_role")))
}

fn session_exercises() -> TableDef {
    TableDef::new("session_exercises", "id")
        .with_column(ColumnDef::required("id", ColumnType::Integer))
        .with_column(ColumnDef::required("movement_id", ColumnType::Integer))
}

fn section(i: i64) -> serde_json::Value {
    match i % 4 {
        0 => json!("warm_up"),
        1 => json!("main"),
        2 => json!("cool_down"),
        _ => json!(null),
    }
}

fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Row::new(),
    }
}

fn initial() -> RevisionUnit {
    let movements = (1..=ROWS)
        .map(|i| row(json!({ "id": i, "name": format!("movement {}", i), "section": section(i) })))
        .collect();
    let exercises = (1..=ROWS)
        .map(|i| row(json!({ "id": i, "movement_id": (i * 7) % ROWS + 1 })))
        .collect();
    let at: DateTime<Utc> = "2024-06-01T08:00:00Z".parse().unwrap();

    RevisionUnit::new("initial", Vec::<String>::new(), at)
        .with_message("initial schema")
        .with_upgrade(OperationSet::reversible(vec![
            Operation::CreateEnum {
                name: "movement_section".to_string(),
                values: vec!["warm_up".to_string(), "main".to_string(), "cool_down".to_string()],
            },
            Operation::CreateTable { table: movements_v1() },
            Operation::CreateTable { table: session_exercises() },
            Operation::AddForeignKey {
                constraint: ForeignKeyDef::new(
                    SESSION_FK,
                    "session_exercises",
                    "movement_id",
                    "movements",
                    "id",
                ),
            },
            Operation::InsertRows {
                table: "movements".to_string(),
                rows: movements,
            },
            Operation::InsertRows {
                table: "session_exercises".to_string(),
                rows: exercises,
            },
        ]))
        .with_downgrade(OperationSet::reversible(vec![
            Operation::DropTable {
                table: "session_exercises".to_string(),
            },
            Operation::DropTable {
                table: "movements".to_string(),
            },
            Operation::DropEnum {
                name: "movement_section".to_string(),
            },
        ]))
}

/// The refactor without any declared late dependents.
fn undeclared_refactor() -> StagedRefactor {
    StagedRefactor::new(movements_v1(), movements_v2())
        .create_enum("movement_role", ["warmup", "main", "cooldown", "mobility"])
        .populate(
            "role",
            Expr::map(
                "section",
                [("warm_up", "warmup"), ("main", "main"), ("cool_down", "cooldown")],
            ),
        )
        .restore(
            "section",
            Expr::map(
                "role",
                [("warmup", "warm_up"), ("main", "main"), ("cooldown", "cool_down")],
            )
            .with_default(json!("main")),
        )
        .batch_size(16)
}

fn refactor() -> StagedRefactor {
    undeclared_refactor().late_foreign_key(SESSION_FK)
}

fn units_for(refactor: &StagedRefactor) -> Vec<RevisionUnit> {
    let start: DateTime<Utc> = "2024-06-02T08:00:00Z".parse().unwrap();
    let mut units = vec![initial()];
    units.extend(refactor.revisions(Some("initial"), start));
    units
}

fn units() -> Vec<RevisionUnit> {
    units_for(&refactor())
}

fn phase(phase: StagePhase) -> Target {
    Target::Revision(refactor().revision_id(phase))
}

struct TestContext {
    migrator: Migrator<EmbeddedDatabase>,
    _sled: sled::Db,
}

impl TestContext {
    fn new(config: MigrationConfig) -> Self {
        Self::with(units(), config, true)
    }

    fn with(units: Vec<RevisionUnit>, config: MigrationConfig, transactional: bool) -> Self {
        let sled = sled::Config::new().temporary(true).open().unwrap();
        let db = EmbeddedDatabase::open(&sled)
            .unwrap()
            .with_transactional_ddl(transactional);
        let migrator = Migrator::open(units, db, &sled, config).unwrap();
        Self {
            migrator,
            _sled: sled,
        }
    }

    fn db(&self) -> &EmbeddedDatabase {
        self.migrator.database()
    }

    fn upgrade(&mut self, target: Target) {
        self.migrator.upgrade(&target).unwrap();
    }
}

fn no_backup_references(db: &EmbeddedDatabase) -> bool {
    db.foreign_keys().iter().all(|fk| !fk.ref_table.starts_with("old_"))
}

#[test]
fn test_populate_copies_every_row() {
    let mut ctx = TestContext::new(MigrationConfig::default());
    ctx.upgrade(phase(StagePhase::Populate));

    let db = ctx.db();
    assert_eq!(db.row_count("new_movements").unwrap(), ROWS as u64);
    assert_eq!(db.row_count("new_movements").unwrap(), db.row_count("movements").unwrap());

    let staged = db.rows("new_movements").unwrap();
    let by_id = |id: i64| {
        staged
            .iter()
            .find(|r| r["id"] == json!(id))
            .map(|r| r["role"].clone())
            .unwrap()
    };
    assert_eq!(by_id(4), json!("warmup"));
    assert_eq!(by_id(5), json!("main"));
    assert_eq!(by_id(6), json!("cooldown"));
    assert_eq!(by_id(7), json!(null));
}

#[test]
fn test_swap_leaves_no_orphans() {
    let mut ctx = TestContext::new(MigrationConfig::default());
    ctx.upgrade(phase(StagePhase::TableSwap));

    let db = ctx.db();
    assert!(db.has_column("movements", "role"));
    assert!(db.has_column("old_movements", "section"));
    assert!(!db.has_table("new_movements"));
    for fk in db.foreign_keys() {
        assert_eq!(db.orphaned_rows(&fk).unwrap(), 0, "{} has orphans", fk.name);
    }
    // The untracked constraint followed the rename.
    assert_eq!(db.foreign_key(SESSION_FK).unwrap().ref_table, "old_movements");
}

#[test]
fn test_fix_foreign_keys_leaves_no_backup_references() {
    let mut ctx = TestContext::new(MigrationConfig::default());
    ctx.upgrade(phase(StagePhase::FixForeignKeys));

    let db = ctx.db();
    assert!(no_backup_references(db));
    assert_eq!(db.foreign_key(SESSION_FK).unwrap().ref_table, "movements");
    assert_eq!(db.orphaned_rows(&db.foreign_key(SESSION_FK).unwrap()).unwrap(), 0);
}

#[test]
fn test_interrupted_populate_resumes_from_checkpoint() {
    let mut ctx = TestContext::with(units(), MigrationConfig::default(), false);
    ctx.upgrade(Target::Revision("initial".to_string()));

    // A section value the populate mapping does not cover, on the last row.
    let db = ctx.migrator.database_mut();
    db.add_enum_values("movement_section", &["stretch".to_string()])
        .unwrap();
    db.upsert_rows(
        "movements",
        vec![row(json!({ "id": ROWS, "name": "movement 100", "section": "stretch" }))],
    )
    .unwrap();

    let err = ctx.migrator.upgrade(&phase(StagePhase::Populate)).unwrap_err();
    match err.root() {
        MigrationError::MigrationFailed { revision, .. } => {
            assert_eq!(revision, "movements_populate")
        }
        other => panic!("expected MigrationFailed, got {:?}", other),
    }
    assert_eq!(
        ctx.migrator.state().unwrap(),
        SchemaState::from_heads([refactor().revision_id(StagePhase::CreateStaging)])
    );

    // Six full batches of 16 landed before the bad row was reached.
    let journal = ctx.migrator.store().journal().unwrap().unwrap();
    assert!(!journal.transactional);
    assert_eq!(journal.revision, "movements_populate");
    assert_eq!(journal.steps[0].processed_count, 96);
    assert_eq!(journal.steps[0].last_key, Some(row_key(&json!(96))));
    assert_eq!(ctx.db().row_count("new_movements").unwrap(), 96);

    ctx.migrator
        .database_mut()
        .upsert_rows(
            "movements",
            vec![row(json!({ "id": ROWS, "name": "movement 100", "section": "main" }))],
        )
        .unwrap();

    let report = ctx.migrator.repair().unwrap();
    let resumed = report.resumed.unwrap();
    assert_eq!(resumed.revision, "movements_populate");
    // Only the rows after the checkpoint were copied again.
    assert_eq!(resumed.rows, 4);
    assert_eq!(
        report.state,
        SchemaState::from_heads([refactor().revision_id(StagePhase::Populate)])
    );
    assert!(ctx.migrator.store().journal().unwrap().is_none());
    assert_eq!(ctx.db().row_count("new_movements").unwrap(), ROWS as u64);
    assert_eq!(
        ctx.db().row_count("new_movements").unwrap(),
        ctx.db().row_count("movements").unwrap()
    );

    ctx.upgrade(phase(StagePhase::FixForeignKeys));
    assert!(no_backup_references(ctx.db()));
}

#[test]
fn test_downgrade_moves_undeclared_dependents_back() {
    let mut ctx = TestContext::with(
        units_for(&undeclared_refactor()),
        MigrationConfig::default(),
        true,
    );
    ctx.upgrade(phase(StagePhase::FixForeignKeys));
    assert_eq!(ctx.db().foreign_key(SESSION_FK).unwrap().ref_table, "movements");

    let report = ctx
        .migrator
        .downgrade(&Target::Revision("initial".to_string()))
        .unwrap();
    assert_eq!(report.applied.len(), 5);

    let db = ctx.db();
    assert!(!db.has_table("new_movements"));
    assert!(!db.has_table("old_movements"));
    assert!(db.has_column("movements", "section"));
    let fk = db.foreign_key(SESSION_FK).unwrap();
    assert_eq!(fk.ref_table, "movements");
    assert_eq!(db.orphaned_rows(&fk).unwrap(), 0);

    ctx.upgrade(phase(StagePhase::FixForeignKeys));
    assert!(no_backup_references(ctx.db()));
}

#[test]
fn test_cleanup_requires_allow_destructive() {
    let mut ctx = TestContext::new(MigrationConfig::default());

    match ctx.migrator.upgrade(&Target::Head) {
        Err(MigrationError::UnsafeOperation { revision, .. }) => {
            assert_eq!(revision, "movements_cleanup")
        }
        other => panic!("expected UnsafeOperation, got {:?}", other.map(|r| r.applied.len())),
    }
    assert!(ctx.migrator.state().unwrap().is_base());
    assert!(ctx.db().table_names().is_empty());

    ctx.migrator
        .set_config(MigrationConfig::default().with_allow_destructive(true));
    ctx.upgrade(Target::Head);

    let shape = ctx.db().shape();
    assert!(shape.tables_with_prefix("old_").is_empty());
    assert!(shape.tables_with_prefix("new_").is_empty());
    assert_eq!(ctx.db().row_count("movements").unwrap(), ROWS as u64);
}

#[test]
fn test_cleanup_blocked_by_remaining_reference() {
    let mut ctx = TestContext::new(MigrationConfig::default().with_allow_destructive(true));
    ctx.upgrade(phase(StagePhase::FixForeignKeys));

    let audit = TableDef::new("movement_audit", "id")
        .with_column(ColumnDef::required("id", ColumnType::Integer))
        .with_column(ColumnDef::new("movement_id", ColumnType::Integer));
    let db = ctx.migrator.database_mut();
    db.create_table(&audit).unwrap();
    db.add_foreign_key(&ForeignKeyDef::new(
        "movement_audit_movement_id_fkey",
        "movement_audit",
        "movement_id",
        "old_movements",
        "id",
    ))
    .unwrap();

    let err = ctx.migrator.upgrade(&Target::Head).unwrap_err();
    match err.root() {
        MigrationError::ReferentialIntegrity { table, constraints } => {
            assert_eq!(table, "old_movements");
            assert_eq!(constraints, &vec!["movement_audit_movement_id_fkey".to_string()]);
        }
        other => panic!("expected ReferentialIntegrity, got {:?}", other),
    }
    assert!(ctx.db().has_table("old_movements"));
    assert_eq!(
        ctx.migrator.state().unwrap(),
        SchemaState::from_heads([refactor().revision_id(StagePhase::FixForeignKeys)])
    );
}

#[test]
fn test_enum_sync_downgrade_is_a_no_op() {
    let mut ctx = TestContext::new(MigrationConfig::default().with_strict_irreversible(true));
    ctx.upgrade(phase(StagePhase::EnumSync));
    assert!(ctx.db().has_enum("movement_role"));

    let initial = Target::Revision("initial".to_string());
    assert!(matches!(
        ctx.migrator.downgrade(&initial),
        Err(MigrationError::IrreversibleStep { .. })
    ));

    ctx.migrator.set_config(MigrationConfig::default());
    let report = ctx.migrator.downgrade(&initial).unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].operations, 0);
    assert_eq!(
        ctx.db().enum_values("movement_role").unwrap(),
        vec!["warmup", "main", "cooldown", "mobility"]
    );
}

#[test]
fn test_full_round_trip() {
    let mut ctx = TestContext::new(MigrationConfig::default().with_allow_destructive(true));
    ctx.upgrade(Target::Revision("initial".to_string()));
    let original_rows = ctx.db().rows("movements").unwrap();
    let original_tables = ctx.db().shape().tables;

    ctx.upgrade(Target::Head);
    let upgraded = ctx.db().shape();
    assert!(no_backup_references(ctx.db()));

    let report = ctx
        .migrator
        .downgrade(&Target::Revision("initial".to_string()))
        .unwrap();
    assert_eq!(report.applied.len(), 6);
    assert_eq!(ctx.db().shape().tables, original_tables);
    assert_eq!(ctx.db().rows("movements").unwrap(), original_rows);
    assert_eq!(ctx.db().foreign_key(SESSION_FK).unwrap().ref_table, "movements");
    // Enum values are never removed.
    assert!(ctx.db().has_enum("movement_role"));

    ctx.upgrade(Target::Head);
    assert_eq!(ctx.db().shape(), upgraded);
}

#[test]
fn test_plan_lists_phases_in_order() {
    let ctx = TestContext::new(MigrationConfig::default());
    let plan = ctx
        .migrator
        .plan(revchain_core::Direction::Up, &Target::Head)
        .unwrap();

    let phases: Vec<StagePhase> = plan.steps.iter().filter_map(|s| s.phase).collect();
    assert_eq!(phases, StagePhase::ORDER.to_vec());
    assert_eq!(plan.warnings.len(), 1);
}
