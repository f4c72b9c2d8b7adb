//! Declarative schema catalog.
//!
//! Every table the store relies on is described here once; the migration
//! engine diffs these descriptions against the live database and generates
//! DDL from them. Nothing mutates the catalog at runtime.

/// Written to `PRAGMA user_version` once every table matches the catalog.
pub const SCHEMA_VERSION: i64 = 2;

pub const PATIENTS: &str = "patients";
pub const VISITS: &str = "visits";
pub const MEDICAL_INTAKE_RECORDS: &str = "medical_intake_records";
pub const DENTAL_INTAKE_RECORDS: &str = "dental_intake_records";
pub const SETTINGS: &str = "settings";

/// Trigram full-text index over patient name and phone fields.
pub const PATIENT_SEARCH: &str = "patients_search";

/// One column of a catalog table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub primary_key: bool,
    pub not_null: bool,
    pub unique: bool,
    /// SQL literal used as the column default
    pub default: Option<&'static str>,
}

impl ColumnSpec {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            sql_type: "TEXT",
            primary_key: false,
            not_null: false,
            unique: false,
            default: None,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self {
            sql_type: "INTEGER",
            ..Self::text(name)
        }
    }

    pub const fn primary_key(self) -> Self {
        Self {
            primary_key: true,
            ..self
        }
    }

    pub const fn required(self) -> Self {
        Self {
            not_null: true,
            ..self
        }
    }

    pub const fn unique(self) -> Self {
        Self {
            unique: true,
            ..self
        }
    }

    pub const fn default_to(self, literal: &'static str) -> Self {
        Self {
            default: Some(literal),
            ..self
        }
    }

    fn definition(&self) -> String {
        let mut def = format!("\"{}\" {}", self.name, self.sql_type);
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        if self.unique {
            def.push_str(" UNIQUE");
        }
        if let Some(default) = self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }
}

/// `column REFERENCES table(references)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKeySpec {
    pub column: &'static str,
    pub table: &'static str,
    pub references: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// External-content FTS5 index kept in step with its table by triggers.
///
/// Rows are keyed on the content table's implicit rowid, which VACUUM may
/// renumber; rebuild the index after compacting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchIndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

impl SearchIndexSpec {
    /// Virtual table plus the insert/delete/update triggers for `table`.
    pub fn ddl(&self, table: &str) -> String {
        let name = self.name;
        let cols = self.columns.join(", ");
        let new_vals = prefixed(self.columns, "new.");
        let old_vals = prefixed(self.columns, "old.");
        format!(
            r#"
CREATE VIRTUAL TABLE IF NOT EXISTS {name} USING fts5(
    {cols},
    content='{table}',
    content_rowid='rowid',
    tokenize='trigram'
);

CREATE TRIGGER IF NOT EXISTS {name}_ai AFTER INSERT ON {table} BEGIN
    INSERT INTO {name}(rowid, {cols}) VALUES (new.rowid, {new_vals});
END;

CREATE TRIGGER IF NOT EXISTS {name}_ad AFTER DELETE ON {table} BEGIN
    INSERT INTO {name}({name}, rowid, {cols}) VALUES ('delete', old.rowid, {old_vals});
END;

CREATE TRIGGER IF NOT EXISTS {name}_au AFTER UPDATE ON {table} BEGIN
    INSERT INTO {name}({name}, rowid, {cols}) VALUES ('delete', old.rowid, {old_vals});
    INSERT INTO {name}(rowid, {cols}) VALUES (new.rowid, {new_vals});
END;
"#
        )
    }

    /// Repopulate the index from its content table.
    pub fn rebuild_sql(&self) -> String {
        format!(
            "INSERT INTO {name}({name}) VALUES ('rebuild');",
            name = self.name
        )
    }
}

fn prefixed(columns: &[&str], prefix: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{prefix}{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Full description of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub foreign_keys: &'static [ForeignKeySpec],
    pub indexes: &'static [IndexSpec],
    pub search: Option<SearchIndexSpec>,
}

impl TableSpec {
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    pub fn primary_key(&self) -> Option<&'static str> {
        self.columns.iter().find(|c| c.primary_key).map(|c| c.name)
    }

    /// Columns that must never be NULL.
    pub fn required_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .filter(|c| c.not_null || c.primary_key)
            .map(|c| c.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `CREATE TABLE` for this spec under `table_name` (the catalog name, or
    /// a shadow name during a rewrite).
    pub fn create_table_sql(&self, table_name: &str) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnSpec::definition).collect();
        parts.extend(self.foreign_keys.iter().map(|fk| {
            format!(
                "FOREIGN KEY (\"{}\") REFERENCES \"{}\"(\"{}\")",
                fk.column, fk.table, fk.references
            )
        }));
        format!(
            "CREATE TABLE \"{}\" (\n    {}\n);\n",
            table_name,
            parts.join(",\n    ")
        )
    }

    /// `CREATE INDEX IF NOT EXISTS` for every required index.
    pub fn index_sql(&self) -> String {
        self.indexes
            .iter()
            .map(|idx| {
                let cols = idx
                    .columns
                    .iter()
                    .map(|c| format!("\"{c}\""))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\"({});\n",
                    idx.name, self.name, cols
                )
            })
            .collect()
    }
}

/// Columns shared by every replicated table.
macro_rules! sync_columns {
    () => {
        [
            ColumnSpec::text("originTablet")
                .required()
                .default_to("'unknown'"),
            ColumnSpec::integer("lastSyncedAt").required().default_to("0"),
            ColumnSpec::integer("syncVersion").required().default_to("1"),
        ]
    };
}

const fn intake_columns() -> [ColumnSpec; 8] {
    let sync = sync_columns!();
    [
        ColumnSpec::text("recordId").primary_key(),
        ColumnSpec::text("visitId").required(),
        ColumnSpec::text("formData").required().default_to("'{}'"),
        ColumnSpec::integer("createdAt").required(),
        ColumnSpec::integer("updatedAt").required(),
        sync[0],
        sync[1],
        sync[2],
    ]
}

const PATIENT_COLUMNS: [ColumnSpec; 11] = {
    let sync = sync_columns!();
    [
        ColumnSpec::text("patientId").primary_key(),
        ColumnSpec::text("firstName").required(),
        ColumnSpec::text("lastName").required(),
        ColumnSpec::text("dateOfBirth").required(),
        ColumnSpec::text("phone"),
        ColumnSpec::text("notes"),
        ColumnSpec::integer("createdAt").required(),
        ColumnSpec::integer("updatedAt").required(),
        sync[0],
        sync[1],
        sync[2],
    ]
};

const VISIT_COLUMNS: [ColumnSpec; 11] = {
    let sync = sync_columns!();
    [
        ColumnSpec::text("visitId").primary_key(),
        ColumnSpec::text("patientId").required(),
        ColumnSpec::text("clinicId").required(),
        ColumnSpec::text("status").required().default_to("'open'"),
        ColumnSpec::text("services").required().default_to("'{}'"),
        ColumnSpec::text("shortCode").required().unique(),
        ColumnSpec::integer("openedAt").required(),
        ColumnSpec::integer("updatedAt").required(),
        sync[0],
        sync[1],
        sync[2],
    ]
};

const MEDICAL_COLUMNS: [ColumnSpec; 8] = intake_columns();
const DENTAL_COLUMNS: [ColumnSpec; 8] = intake_columns();

const SETTING_COLUMNS: [ColumnSpec; 3] = [
    ColumnSpec::text("key").primary_key(),
    ColumnSpec::text("value").required(),
    ColumnSpec::integer("updatedAt").required(),
];

const INTAKE_VISIT_FK: [ForeignKeySpec; 1] = [ForeignKeySpec {
    column: "visitId",
    table: VISITS,
    references: "visitId",
}];

/// Every table, in creation order (parents before children).
pub static CATALOG: &[TableSpec] = &[
    TableSpec {
        name: PATIENTS,
        columns: &PATIENT_COLUMNS,
        foreign_keys: &[],
        indexes: &[
            IndexSpec { name: "idx_patients_firstName", columns: &["firstName"] },
            IndexSpec { name: "idx_patients_lastName", columns: &["lastName"] },
            IndexSpec { name: "idx_patients_phone", columns: &["phone"] },
            IndexSpec { name: "idx_patients_lastSyncedAt", columns: &["lastSyncedAt"] },
            IndexSpec { name: "idx_patients_originTablet", columns: &["originTablet"] },
        ],
        search: Some(SearchIndexSpec {
            name: PATIENT_SEARCH,
            columns: &["firstName", "lastName", "phone"],
        }),
    },
    TableSpec {
        name: VISITS,
        columns: &VISIT_COLUMNS,
        foreign_keys: &[],
        indexes: &[
            IndexSpec { name: "idx_visits_shortCode", columns: &["shortCode"] },
            IndexSpec { name: "idx_visits_patientId", columns: &["patientId"] },
            IndexSpec { name: "idx_visits_status", columns: &["status"] },
            IndexSpec { name: "idx_visits_lastSyncedAt", columns: &["lastSyncedAt"] },
            IndexSpec { name: "idx_visits_originTablet", columns: &["originTablet"] },
        ],
        search: None,
    },
    TableSpec {
        name: MEDICAL_INTAKE_RECORDS,
        columns: &MEDICAL_COLUMNS,
        foreign_keys: &INTAKE_VISIT_FK,
        indexes: &[
            IndexSpec { name: "idx_medical_records_visitId", columns: &["visitId"] },
            IndexSpec { name: "idx_medical_records_lastSyncedAt", columns: &["lastSyncedAt"] },
        ],
        search: None,
    },
    TableSpec {
        name: DENTAL_INTAKE_RECORDS,
        columns: &DENTAL_COLUMNS,
        foreign_keys: &INTAKE_VISIT_FK,
        indexes: &[
            IndexSpec { name: "idx_dental_records_visitId", columns: &["visitId"] },
            IndexSpec { name: "idx_dental_records_lastSyncedAt", columns: &["lastSyncedAt"] },
        ],
        search: None,
    },
    TableSpec {
        name: SETTINGS,
        columns: &SETTING_COLUMNS,
        foreign_keys: &[],
        indexes: &[],
        search: None,
    },
];

/// Look up a catalog table by name.
pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    CATALOG.iter().find(|t| t.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_catalog_ddl_valid() {
        let conn = Connection::open_in_memory().unwrap();
        for spec in CATALOG {
            let result = conn.execute_batch(&spec.create_table_sql(spec.name));
            assert!(result.is_ok(), "{} DDL should be valid: {:?}", spec.name, result);
            conn.execute_batch(&spec.index_sql()).unwrap();
            if let Some(search) = &spec.search {
                conn.execute_batch(&search.ddl(spec.name)).unwrap();
            }
        }
    }

    #[test]
    fn test_catalog_shape() {
        let visits = table_spec(VISITS).unwrap();
        assert_eq!(visits.primary_key(), Some("visitId"));
        assert!(visits.column("shortCode").unwrap().unique);
        assert!(visits.column("qrPayload").is_none());

        let patients = table_spec(PATIENTS).unwrap();
        let required: Vec<_> = patients.required_columns().collect();
        assert!(required.contains(&"firstName"));
        assert!(!required.contains(&"phone"));

        for kind in [MEDICAL_INTAKE_RECORDS, DENTAL_INTAKE_RECORDS] {
            let spec = table_spec(kind).unwrap();
            assert_eq!(spec.foreign_keys.len(), 1);
            assert_eq!(spec.foreign_keys[0].table, VISITS);
        }
    }

    #[test]
    fn test_shared_sync_columns() {
        for name in [PATIENTS, VISITS, MEDICAL_INTAKE_RECORDS, DENTAL_INTAKE_RECORDS] {
            let spec = table_spec(name).unwrap();
            for column in ["originTablet", "lastSyncedAt", "syncVersion"] {
                assert!(spec.column(column).is_some(), "{name} missing {column}");
            }
        }
        assert!(table_spec(SETTINGS).unwrap().column("syncVersion").is_none());
    }

    #[test]
    fn test_search_trigger_keeps_index_in_sync() {
        let conn = Connection::open_in_memory().unwrap();
        let spec = table_spec(PATIENTS).unwrap();
        conn.execute_batch(&spec.create_table_sql(spec.name)).unwrap();
        conn.execute_batch(&spec.search.unwrap().ddl(spec.name)).unwrap();

        conn.execute(
            "INSERT INTO patients (patientId, firstName, lastName, dateOfBirth, createdAt, updatedAt)
             VALUES ('PT-A-001', 'Guadalupe', 'Hernandez', '1970-02-03', 0, 0)",
            [],
        )
        .unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM patients_search WHERE patients_search MATCH '\"ADALU\"'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
