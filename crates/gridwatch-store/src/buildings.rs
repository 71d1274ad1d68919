//! Static catalogs: buildings and service categories.
//!
//! Both are compiled in and seeded idempotently at init; neither is created
//! through the API. `sections_count` bounds the valid `section_id` range for
//! a building's sensors and subscribers.

use rusqlite::{params, Connection};

use crate::database::Store;
use crate::error::{Result, StoreError};
use crate::models::Building;

/// `(id, name, address, sections_count)` rows seeded on first start.
const CATALOG: &[(i64, &str, &str, i64)] = &[
    (1, "Newcastle", "24-v", 3),
    (2, "Oxford", "28-b", 2),
    (3, "Cambridge", "26", 2),
    (4, "Liverpool", "24-a", 1),
    (5, "Bristol", "24-b", 1),
    (6, "Birmingham", "26-b", 1),
    (7, "Chester", "28-d", 1),
    (8, "Manchester", "26-g", 1),
];

const SERVICE_CATEGORIES: &[&str] = &[
    "Cafes",
    "Groceries",
    "Pharmacies",
    "Household services",
    "Shelters",
];

pub(crate) fn seed_catalog(conn: &Connection) -> Result<()> {
    for (id, name, address, sections_count) in CATALOG {
        conn.execute(
            "INSERT OR IGNORE INTO buildings (id, name, address, sections_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, name, address, sections_count],
        )?;
    }
    for name in SERVICE_CATEGORIES {
        conn.execute(
            "INSERT OR IGNORE INTO general_services (name) VALUES (?1)",
            params![name],
        )?;
    }
    Ok(())
}

impl Store {
    /// Fetch a single building by id.
    pub fn get_building(&self, id: i64) -> Result<Building> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, name, address, sections_count FROM buildings WHERE id = ?1",
                params![id],
                row_to_building,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
        })
    }

    /// List the whole catalog ordered by id.
    pub fn list_buildings(&self) -> Result<Vec<Building>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, address, sections_count FROM buildings ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], row_to_building)?;

            let mut buildings = Vec::new();
            for row in rows {
                buildings.push(row?);
            }
            Ok(buildings)
        })
    }

    /// Seeded service categories, ordered by name.
    pub fn list_service_categories(&self) -> Result<Vec<(i64, String)>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name FROM general_services ORDER BY name ASC")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

            let mut categories = Vec::new();
            for row in rows {
                categories.push(row?);
            }
            Ok(categories)
        })
    }

    /// Number of sections for a building, or `None` for an unknown building.
    pub fn building_sections_count(&self, id: i64) -> Result<Option<i64>> {
        use rusqlite::OptionalExtension;

        self.read(|conn| {
            conn.query_row(
                "SELECT sections_count FROM buildings WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
    }
}

fn row_to_building(row: &rusqlite::Row<'_>) -> rusqlite::Result<Building> {
    Ok(Building {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        sections_count: row.get(3)?,
    })
}
