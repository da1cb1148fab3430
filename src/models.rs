//! Core data types: the entity catalogue, record rows, and the join tables
//! that link entities together.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A domain record type shown in a list/detail/edit view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Muscle,
    Organ,
    Meridian,
    Dysfunction,
    MuscleGroup,
    Receptor,
    ReceptorClass,
    Tool,
    Entry,
    Media,
}

impl Entity {
    pub const ALL: [Entity; 10] = [
        Entity::Muscle,
        Entity::Organ,
        Entity::Meridian,
        Entity::Dysfunction,
        Entity::MuscleGroup,
        Entity::Receptor,
        Entity::ReceptorClass,
        Entity::Tool,
        Entity::Entry,
        Entity::Media,
    ];

    /// Remote table name.
    pub fn table(&self) -> &'static str {
        match self {
            Entity::Muscle => "muscles",
            Entity::Organ => "organs",
            Entity::Meridian => "meridians",
            Entity::Dysfunction => "dysfunctions",
            Entity::MuscleGroup => "muscle_groups",
            Entity::Receptor => "receptors",
            Entity::ReceptorClass => "receptor_classes",
            Entity::Tool => "tools",
            Entity::Entry => "entries",
            Entity::Media => "media",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Entity::Muscle => "Muscle",
            Entity::Organ => "Organ",
            Entity::Meridian => "Meridian",
            Entity::Dysfunction => "Dysfunction",
            Entity::MuscleGroup => "Muscle group",
            Entity::Receptor => "Receptor",
            Entity::ReceptorClass => "Receptor class",
            Entity::Tool => "Tool",
            Entity::Entry => "Entry",
            Entity::Media => "Media",
        }
    }

    fn slug(&self) -> &'static str {
        match self {
            Entity::Muscle => "muscle",
            Entity::Organ => "organ",
            Entity::Meridian => "meridian",
            Entity::Dysfunction => "dysfunction",
            Entity::MuscleGroup => "muscle-group",
            Entity::Receptor => "receptor",
            Entity::ReceptorClass => "receptor-class",
            Entity::Tool => "tool",
            Entity::Entry => "entry",
            Entity::Media => "media",
        }
    }

    /// Resolve a table name (`muscle_groups`) or singular slug (`muscle-group`).
    pub fn from_table(name: &str) -> Result<Entity> {
        let name = name.trim().to_ascii_lowercase();
        for entity in Entity::ALL {
            if entity.table() == name
                || entity.slug() == name
                || entity.slug().replace('-', "_") == name
            {
                return Ok(entity);
            }
        }
        let valid: Vec<&str> = Entity::ALL.iter().map(|e| e.table()).collect();
        bail!(
            "invalid table: '{}'. Must be one of: {}",
            name,
            valid.join(", ")
        )
    }

    /// Fields scanned by free-text search.
    pub fn search_fields(&self) -> &'static [&'static str] {
        match self {
            Entity::Muscle => &["name", "latin_name", "description"],
            Entity::Organ | Entity::Meridian | Entity::MuscleGroup => &["name", "description"],
            Entity::Dysfunction => &["name", "description", "symptoms"],
            Entity::Receptor | Entity::ReceptorClass => &["name", "description"],
            Entity::Tool => &["name", "description", "usage"],
            Entity::Entry => &["name", "description", "body"],
            Entity::Media => &["name", "url"],
        }
    }

    /// Column that scopes `display_order`; media is ordered per entry.
    pub fn order_scope(&self) -> Option<&'static str> {
        match self {
            Entity::Media => Some("entry_id"),
            _ => None,
        }
    }

    /// Foreign-key parent of this entity: `(fk column, parent, field name)`.
    pub fn parent(&self) -> Option<(&'static str, Entity, &'static str)> {
        match self {
            Entity::Receptor => Some(("receptor_class_id", Entity::ReceptorClass, "receptor_class")),
            Entity::Media => Some(("entry_id", Entity::Entry, "entry")),
            _ => None,
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// One row of a remote table, kept as a JSON object so extra columns pass
/// through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from a JSON value; non-objects are rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => bail!("invalid record: expected a JSON object, got {}", other),
        }
    }

    /// Row id as a string. Numeric ids are rendered in decimal.
    pub fn id(&self) -> Option<String> {
        self.get_str("id")
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    pub fn display_order(&self) -> Option<i64> {
        self.0.get("display_order").and_then(Value::as_i64)
    }

    pub fn set_display_order(&mut self, order: i64) {
        self.0.insert("display_order".to_string(), Value::from(order));
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    /// Scalar field rendered as a string (`null` and missing are `None`).
    pub fn get_str(&self, field: &str) -> Option<String> {
        self.get(field).and_then(scalar_string)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// String form of a scalar JSON value, used for filter and id comparisons.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// JSON value for an id given as a string: integer ids stay numeric so
/// integer key columns accept them.
pub fn id_value(id: &str) -> Value {
    match id.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(id),
    }
}

/// Which end of a [`Relation`] an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn parse(s: &str) -> Result<Side> {
        match s {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => bail!("invalid side: '{}'. Must be left or right.", other),
        }
    }
}

/// A many-to-many join table between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub join_table: &'static str,
    pub left: Entity,
    pub left_column: &'static str,
    pub right: Entity,
    pub right_column: &'static str,
}

pub const RELATIONS: [Relation; 5] = [
    Relation {
        join_table: "muscle_organs",
        left: Entity::Muscle,
        left_column: "muscle_id",
        right: Entity::Organ,
        right_column: "organ_id",
    },
    Relation {
        join_table: "muscle_meridians",
        left: Entity::Muscle,
        left_column: "muscle_id",
        right: Entity::Meridian,
        right_column: "meridian_id",
    },
    Relation {
        join_table: "muscle_dysfunctions",
        left: Entity::Muscle,
        left_column: "muscle_id",
        right: Entity::Dysfunction,
        right_column: "dysfunction_id",
    },
    Relation {
        join_table: "muscle_group_muscles",
        left: Entity::MuscleGroup,
        left_column: "muscle_group_id",
        right: Entity::Muscle,
        right_column: "muscle_id",
    },
    Relation {
        join_table: "entry_tools",
        left: Entity::Entry,
        left_column: "entry_id",
        right: Entity::Tool,
        right_column: "tool_id",
    },
];

impl Relation {
    pub fn find(join_table: &str) -> Result<Relation> {
        RELATIONS
            .iter()
            .find(|r| r.join_table == join_table)
            .copied()
            .ok_or_else(|| {
                let valid: Vec<&str> = RELATIONS.iter().map(|r| r.join_table).collect();
                anyhow::anyhow!(
                    "relation not found: '{}'. Known relations: {}",
                    join_table,
                    valid.join(", ")
                )
            })
    }

    /// All relations the entity participates in, with the side it sits on.
    pub fn involving(entity: Entity) -> Vec<(Relation, Side)> {
        let mut out = Vec::new();
        for r in RELATIONS {
            if r.left == entity {
                out.push((r, Side::Left));
            }
            if r.right == entity {
                out.push((r, Side::Right));
            }
        }
        out
    }

    pub fn entity(&self, side: Side) -> Entity {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    /// Resolve a side given as `left`/`right` or as one of the two entity
    /// names (`organs`, `muscle`, ...).
    pub fn side_of(&self, name: &str) -> Result<Side> {
        if let Ok(side) = Side::parse(name) {
            return Ok(side);
        }
        let entity = Entity::from_table(name)?;
        if entity == self.left {
            Ok(Side::Left)
        } else if entity == self.right {
            Ok(Side::Right)
        } else {
            bail!(
                "invalid side: {} is not part of {}",
                entity.table(),
                self.join_table
            )
        }
    }

    pub fn column(&self, side: Side) -> &'static str {
        match side {
            Side::Left => self.left_column,
            Side::Right => self.right_column,
        }
    }
}
