//! Table derivation and the flat leaf-column layout of each table.
//!
//! A table is a protobuf message whose instances become rows. Its layout is compiled once into a
//! [`MessagePlan`]: the walk order of the fields, the Parquet repetition of each field, and the
//! column index of every leaf. Leaf columns are numbered depth-first in field declaration order,
//! the same order Parquet enumerates the leaves of a group type, so a plan column index is also
//! the index of the matching column chunk in the file.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    ops::Range,
    sync::Arc,
};

use parquet::{
    basic::{LogicalType, Repetition as ParquetRepetition, TimeUnit, Type as PhysicalType},
    schema::types::{SchemaDescriptor, Type, TypePtr},
};
use prost_reflect::{EnumDescriptor, FieldDescriptor, Kind, MessageDescriptor};

use crate::{
    column_type::{ColumnType, FIXED_256_LEN, FIXED_256_PRECISION},
    error::SchemaError,
    extract::RowExtractor,
};

pub(crate) const TIMESTAMP_FULL_NAME: &str = "google.protobuf.Timestamp";

/// How tables are picked from the output message when no explicit table is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMode {
    /// One table per repeated message field of the root, or the root itself when there is none.
    #[default]
    Auto,
    /// The root message is the single table, one row per payload.
    Root,
    /// The single repeated message field of the root is the table, one row per element.
    RowList,
}

/// Overrides applied while deriving tables, keyed by protobuf full names.
#[derive(Debug, Clone, Default)]
pub struct SchemaOptions {
    pub mode: TableMode,
    /// Explicit tables, message full name to table name. Takes precedence over `mode`.
    pub tables: BTreeMap<String, String>,
    /// Fields left out of every table (`package.Message.field`).
    pub ignored_fields: HashSet<String>,
    /// Fields stored as 256-bit fixed-length columns.
    pub column_types: HashMap<String, ColumnType>,
}

impl SchemaOptions {
    fn is_ignored(&self, field: &FieldDescriptor) -> bool {
        self.ignored_fields.contains(field.full_name())
    }
}

/// Parquet repetition of a field, as seen by the row encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
    /// Always present, contributes no definition level.
    Required,
    /// Present or absent, contributes one definition level.
    Optional,
    /// Zero or more elements, contributes one definition and one repetition level.
    Repeated,
}

impl From<Repetition> for ParquetRepetition {
    fn from(value: Repetition) -> Self {
        match value {
            Repetition::Required => ParquetRepetition::REQUIRED,
            Repetition::Optional => ParquetRepetition::OPTIONAL,
            Repetition::Repeated => ParquetRepetition::REPEATED,
        }
    }
}

/// Logical kind of a leaf column.
#[derive(Debug, Clone)]
pub enum LeafKind {
    Boolean,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
    Bytes,
    /// Stored as the symbol name.
    Enum(EnumDescriptor),
    /// `google.protobuf.Timestamp`, stored as nanoseconds since epoch.
    Timestamp,
    Fixed256(ColumnType),
}

#[derive(Debug, Clone)]
pub enum FieldNode {
    Leaf { column: usize, kind: LeafKind },
    Group(MessagePlan),
}

#[derive(Debug, Clone)]
pub struct FieldPlan {
    pub descriptor: FieldDescriptor,
    pub repetition: Repetition,
    pub node: FieldNode,
    /// Leaf columns under this field, contiguous because of depth-first numbering.
    pub columns: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct MessagePlan {
    pub descriptor: MessageDescriptor,
    pub fields: Vec<FieldPlan>,
}

/// A derived table: its name, its compiled layout and its Parquet schema.
#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    plan: MessagePlan,
    schema: Arc<SchemaDescriptor>,
}

impl TableSchema {
    /// Compiles the layout of `message` into a table named `name`.
    pub fn new(
        name: impl Into<String>,
        message: &MessageDescriptor,
        options: &SchemaOptions,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let mut builder = PlanBuilder {
            options,
            next_column: 0,
            stack: Vec::new(),
        };

        let (plan, fields) = builder.message_plan(message)?;
        if fields.is_empty() {
            return Err(SchemaError::EmptyTable { table: name });
        }

        let root = Type::group_type_builder(&name)
            .with_fields(fields)
            .build()
            .map_err(|source| SchemaError::ParquetType {
                path: name.clone(),
                source,
            })?;
        let schema = Arc::new(SchemaDescriptor::new(Arc::new(root)));
        debug_assert_eq!(schema.num_columns(), builder.next_column);

        tracing::debug!(
            table = %name,
            message = %message.full_name(),
            columns = schema.num_columns(),
            "derived table schema"
        );

        Ok(Self { name, plan, schema })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plan(&self) -> &MessagePlan {
        &self.plan
    }

    pub fn message(&self) -> &MessageDescriptor {
        &self.plan.descriptor
    }

    pub fn parquet_schema(&self) -> &Arc<SchemaDescriptor> {
        &self.schema
    }

    pub fn root_type(&self) -> TypePtr {
        self.schema.root_schema_ptr()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.num_columns()
    }
}

struct PlanBuilder<'a> {
    options: &'a SchemaOptions,
    next_column: usize,
    stack: Vec<String>,
}

impl PlanBuilder<'_> {
    fn message_plan(
        &mut self,
        message: &MessageDescriptor,
    ) -> Result<(MessagePlan, Vec<TypePtr>), SchemaError> {
        self.stack.push(message.full_name().to_string());

        let mut fields = Vec::new();
        let mut types = Vec::new();

        for field in message.fields() {
            if self.options.is_ignored(&field) {
                continue;
            }
            if field.is_map() {
                return Err(SchemaError::MapField {
                    field: field.full_name().to_string(),
                });
            }
            if field.is_group() {
                return Err(SchemaError::UnsupportedFieldKind {
                    field: field.full_name().to_string(),
                    kind: "group".to_string(),
                });
            }

            let first_column = self.next_column;
            let leaf = self.leaf_kind(&field)?;
            let repetition = if field.is_list() {
                Repetition::Repeated
            } else if leaf.is_none() || field.supports_presence() {
                Repetition::Optional
            } else {
                Repetition::Required
            };

            let (node, ty) = match leaf {
                Some(kind) => {
                    let ty = leaf_type(field.name(), &kind, repetition).map_err(|source| {
                        SchemaError::ParquetType {
                            path: field.full_name().to_string(),
                            source,
                        }
                    })?;
                    let column = self.next_column;
                    self.next_column += 1;

                    (FieldNode::Leaf { column, kind }, ty)
                }
                None => {
                    let Kind::Message(nested) = field.kind() else {
                        unreachable!("non message kinds always map to a leaf");
                    };
                    if self.stack.iter().any(|name| name == nested.full_name()) {
                        return Err(SchemaError::RecursiveMessage {
                            message: nested.full_name().to_string(),
                            field: field.full_name().to_string(),
                        });
                    }

                    let (plan, children) = self.message_plan(&nested)?;
                    if children.is_empty() {
                        // Parquet groups need at least one child
                        continue;
                    }

                    let ty = Type::group_type_builder(field.name())
                        .with_repetition(repetition.into())
                        .with_fields(children)
                        .build()
                        .map_err(|source| SchemaError::ParquetType {
                            path: field.full_name().to_string(),
                            source,
                        })?;

                    (FieldNode::Group(plan), ty)
                }
            };

            types.push(Arc::new(ty));
            fields.push(FieldPlan {
                descriptor: field,
                repetition,
                node,
                columns: first_column..self.next_column,
            });
        }

        self.stack.pop();

        Ok((
            MessagePlan {
                descriptor: message.clone(),
                fields,
            },
            types,
        ))
    }

    /// Leaf kind of `field`, `None` for nested messages.
    fn leaf_kind(&self, field: &FieldDescriptor) -> Result<Option<LeafKind>, SchemaError> {
        let kind = field.kind();

        if let Some(column_type) = self.options.column_types.get(field.full_name()) {
            return match kind {
                Kind::String
                | Kind::Int32
                | Kind::Sint32
                | Kind::Sfixed32
                | Kind::Int64
                | Kind::Sint64
                | Kind::Sfixed64
                | Kind::Uint32
                | Kind::Fixed32
                | Kind::Uint64
                | Kind::Fixed64 => Ok(Some(LeafKind::Fixed256(*column_type))),
                other => Err(SchemaError::InvalidColumnType {
                    field: field.full_name().to_string(),
                    column_type: *column_type,
                    kind: kind_name(&other).to_string(),
                }),
            };
        }

        let leaf = match kind {
            Kind::Bool => LeafKind::Boolean,
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => LeafKind::Int32,
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => LeafKind::Int64,
            Kind::Uint32 | Kind::Fixed32 => LeafKind::UInt32,
            Kind::Uint64 | Kind::Fixed64 => LeafKind::UInt64,
            Kind::Float => LeafKind::Float,
            Kind::Double => LeafKind::Double,
            Kind::String => LeafKind::String,
            Kind::Bytes => LeafKind::Bytes,
            Kind::Enum(descriptor) => LeafKind::Enum(descriptor),
            Kind::Message(message) if message.full_name() == TIMESTAMP_FULL_NAME => {
                LeafKind::Timestamp
            }
            Kind::Message(_) => return Ok(None),
        };

        Ok(Some(leaf))
    }
}

fn leaf_type(
    name: &str,
    kind: &LeafKind,
    repetition: Repetition,
) -> Result<Type, parquet::errors::ParquetError> {
    let builder = match kind {
        LeafKind::Boolean => Type::primitive_type_builder(name, PhysicalType::BOOLEAN),
        LeafKind::Int32 => Type::primitive_type_builder(name, PhysicalType::INT32),
        LeafKind::Int64 => Type::primitive_type_builder(name, PhysicalType::INT64),
        LeafKind::UInt32 => Type::primitive_type_builder(name, PhysicalType::INT32)
            .with_logical_type(Some(LogicalType::Integer {
                bit_width: 32,
                is_signed: false,
            })),
        LeafKind::UInt64 => Type::primitive_type_builder(name, PhysicalType::INT64)
            .with_logical_type(Some(LogicalType::Integer {
                bit_width: 64,
                is_signed: false,
            })),
        LeafKind::Float => Type::primitive_type_builder(name, PhysicalType::FLOAT),
        LeafKind::Double => Type::primitive_type_builder(name, PhysicalType::DOUBLE),
        LeafKind::String => Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY)
            .with_logical_type(Some(LogicalType::String)),
        LeafKind::Bytes => Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY),
        LeafKind::Enum(_) => Type::primitive_type_builder(name, PhysicalType::BYTE_ARRAY)
            .with_logical_type(Some(LogicalType::Enum)),
        LeafKind::Timestamp => Type::primitive_type_builder(name, PhysicalType::INT64)
            .with_logical_type(Some(LogicalType::Timestamp {
                is_adjusted_to_u_t_c: true,
                unit: TimeUnit::NANOS(Default::default()),
            })),
        LeafKind::Fixed256(_) => {
            Type::primitive_type_builder(name, PhysicalType::FIXED_LEN_BYTE_ARRAY)
                .with_length(FIXED_256_LEN as i32)
                .with_logical_type(Some(LogicalType::Decimal {
                    scale: 0,
                    precision: FIXED_256_PRECISION,
                }))
                .with_precision(FIXED_256_PRECISION)
                .with_scale(0)
        }
    };

    builder.with_repetition(repetition.into()).build()
}

fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int32 => "int32",
        Kind::Int64 => "int64",
        Kind::Uint32 => "uint32",
        Kind::Uint64 => "uint64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Fixed32 => "fixed32",
        Kind::Fixed64 => "fixed64",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        Kind::Message(_) => "message",
        Kind::Enum(_) => "enum",
    }
}

/// The derived tables of an output message and the extractor producing their rows.
#[derive(Debug, Clone)]
pub struct TableSet {
    pub tables: Vec<TableSchema>,
    pub extractor: RowExtractor,
}

/// Derives the tables of `root`.
///
/// Explicit `options.tables` win. Otherwise `options.mode` decides, see [`TableMode`].
pub fn derive_tables(
    root: &MessageDescriptor,
    options: &SchemaOptions,
) -> Result<TableSet, SchemaError> {
    if !options.tables.is_empty() {
        return derive_explicit_tables(root, options);
    }

    let repeated = row_source_fields(root, options);
    let mode = match (options.mode, repeated.len()) {
        (TableMode::Auto, 0) => TableMode::Root,
        (TableMode::Auto, _) => TableMode::Auto,
        (mode, _) => mode,
    };

    let set = match mode {
        TableMode::Root => {
            let table = TableSchema::new(snake_case(root.name()), root, options)?;
            TableSet {
                extractor: RowExtractor::Root {
                    table: table.name().to_string(),
                },
                tables: vec![table],
            }
        }
        TableMode::RowList => {
            let field = match repeated.as_slice() {
                [field] => field.clone(),
                [] => {
                    return Err(SchemaError::RowSourceNotFound {
                        message: root.full_name().to_string(),
                    });
                }
                fields => {
                    return Err(SchemaError::AmbiguousRowSource {
                        message: root.full_name().to_string(),
                        fields: fields.iter().map(|f| f.name().to_string()).collect(),
                    });
                }
            };

            let table = table_for_field(&field, options)?;
            TableSet {
                extractor: RowExtractor::RowList {
                    table: table.name().to_string(),
                    field,
                },
                tables: vec![table],
            }
        }
        TableMode::Auto => {
            let mut tables = Vec::with_capacity(repeated.len());
            let mut fields = Vec::with_capacity(repeated.len());
            for field in repeated {
                let table = table_for_field(&field, options)?;
                fields.push((table.name().to_string(), field));
                tables.push(table);
            }

            TableSet {
                tables,
                extractor: RowExtractor::RepeatedFields { fields },
            }
        }
    };

    ensure_unique_names(&set.tables)?;
    Ok(set)
}

fn derive_explicit_tables(
    root: &MessageDescriptor,
    options: &SchemaOptions,
) -> Result<TableSet, SchemaError> {
    let mut tables = Vec::new();
    let mut by_message = HashMap::new();

    for message in reachable_messages(root, options) {
        if let Some(name) = options.tables.get(message.full_name()) {
            by_message.insert(message.full_name().to_string(), name.clone());
            tables.push(TableSchema::new(name.clone(), &message, options)?);
        }
    }

    if tables.is_empty() {
        return Err(SchemaError::NoTableFound {
            message: root.full_name().to_string(),
            tables: options.tables.keys().cloned().collect(),
        });
    }

    ensure_unique_names(&tables)?;
    Ok(TableSet {
        tables,
        extractor: RowExtractor::Tables { by_message },
    })
}

/// Repeated message fields of `root` eligible as a row source, in declaration order.
fn row_source_fields(root: &MessageDescriptor, options: &SchemaOptions) -> Vec<FieldDescriptor> {
    root.fields()
        .filter(|field| field.is_list() && !options.is_ignored(field))
        .filter(|field| {
            matches!(field.kind(), Kind::Message(message) if message.full_name() != TIMESTAMP_FULL_NAME)
        })
        .collect()
}

fn table_for_field(
    field: &FieldDescriptor,
    options: &SchemaOptions,
) -> Result<TableSchema, SchemaError> {
    let Kind::Message(message) = field.kind() else {
        unreachable!("row source fields are message fields");
    };
    TableSchema::new(snake_case(field.json_name()), &message, options)
}

/// Every message type reachable from `root` (itself included), breadth first.
fn reachable_messages(root: &MessageDescriptor, options: &SchemaOptions) -> Vec<MessageDescriptor> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root.clone()]);
    let mut out = Vec::new();

    while let Some(message) = queue.pop_front() {
        if !seen.insert(message.full_name().to_string()) {
            continue;
        }
        for field in message.fields() {
            if options.is_ignored(&field) {
                continue;
            }
            if let Kind::Message(nested) = field.kind() {
                queue.push_back(nested);
            }
        }
        out.push(message);
    }

    out
}

fn ensure_unique_names(tables: &[TableSchema]) -> Result<(), SchemaError> {
    let mut names = HashSet::new();
    for table in tables {
        if !names.insert(table.name()) {
            return Err(SchemaError::DuplicateTable {
                table: table.name().to_string(),
            });
        }
    }
    Ok(())
}

/// `TokenTransfers` and `tokenTransfers` both become `token_transfers`.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut previous_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if previous_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            previous_lower = false;
        } else {
            previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}
