//! Schema catalogue and result column type resolution.
//!
//! The catalogue is a flat copy of `INFORMATION_SCHEMA.COLUMNS` for a target.
//! Given a parsed `SELECT`, [`DataTypeInfo::column_types`] walks the AST and
//! works out the MySQL data type of every projected column, so results coming
//! back from runops as plain text can be re-typed before they reach the client.

use crate::error::{ProxyError, ProxyResult};
use crate::executor::{ColumnValue, QueryExecutor, ResultSet};
use sqlparser::ast::{
    DataType, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Ident, ObjectName,
    ObjectNamePart, Query, SelectItem, SelectItemQualifiedWildcardKind, SetExpr, SetOperator,
    Statement, TableFactor, TableWithJoins,
};
use tracing::{debug, info};

/// Query used to load the catalogue.
pub const COLUMNS_QUERY: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, DATA_TYPE, IS_NULLABLE \
     FROM INFORMATION_SCHEMA.COLUMNS \
     ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION";

/// A result column name with its data type, when it could be resolved.
pub type ResolvedColumn = (String, Option<String>);

/// One column of the catalogue.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaColumn {
    pub schema: String,
    pub table: String,
    pub column: String,
    /// Lowercase `DATA_TYPE`.
    pub data_type: Option<String>,
}

impl SchemaColumn {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
            data_type: Some(data_type.into().to_ascii_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataTypeInfo {
    columns: Vec<SchemaColumn>,
}

impl DataTypeInfo {
    pub fn new(columns: Vec<SchemaColumn>) -> Self {
        Self { columns }
    }

    /// Load the catalogue of every schema visible to the target.
    pub async fn load<E>(executor: &mut E) -> ProxyResult<Self>
    where
        E: QueryExecutor + ?Sized,
    {
        info!("Loading database structure");
        let result = executor.query(COLUMNS_QUERY).await?.ok_or_else(|| {
            ProxyError::type_discovery("catalogue query returned no result")
        })?;
        let info = Self::from_result(&result);
        info!(columns = info.len(), "Database structure loaded");
        Ok(info)
    }

    /// Build the catalogue from a `COLUMNS_QUERY` result.
    pub fn from_result(result: &ResultSet) -> Self {
        let columns = result
            .rows
            .iter()
            .filter(|row| row.len() >= 4)
            .filter_map(|row| {
                Some(SchemaColumn {
                    schema: row[0].as_str()?.to_string(),
                    table: row[1].as_str()?.to_string(),
                    column: row[2].as_str()?.to_string(),
                    data_type: match &row[3] {
                        ColumnValue::Null => None,
                        value => value.as_str().map(str::to_ascii_lowercase),
                    },
                })
            })
            .collect();
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[SchemaColumn] {
        &self.columns
    }

    /// Resolve the projected columns of a single `SELECT` statement.
    ///
    /// Unqualified tables are looked up in `default_schema`. Columns that
    /// cannot be resolved come back with no type; constructs the resolver
    /// does not understand at all are an error.
    pub fn column_types(
        &self,
        default_schema: Option<&str>,
        statements: &[Statement],
    ) -> ProxyResult<Vec<ResolvedColumn>> {
        let statement = match statements {
            [] => return Ok(Vec::new()),
            [statement] => statement,
            _ => {
                return Err(ProxyError::type_discovery(
                    "multiple statements are not supported",
                ));
            }
        };

        let resolver = Resolver {
            catalogue: self,
            default_schema,
        };
        match statement {
            Statement::Query(query) => resolver.query(query),
            other => Err(ProxyError::type_discovery(format!(
                "not a query: {}",
                other
            ))),
        }
    }
}

/// A column visible in a `FROM` clause, under the table alias it is reached by.
#[derive(Debug, Clone)]
struct ScopeColumn {
    qualifier: String,
    name: String,
    data_type: Option<String>,
}

type Scope = Vec<ScopeColumn>;

struct Resolver<'a> {
    catalogue: &'a DataTypeInfo,
    default_schema: Option<&'a str>,
}

impl Resolver<'_> {
    fn query(&self, query: &Query) -> ProxyResult<Vec<ResolvedColumn>> {
        self.set_expr(&query.body)
    }

    fn set_expr(&self, set_expr: &SetExpr) -> ProxyResult<Vec<ResolvedColumn>> {
        match set_expr {
            SetExpr::Select(select) => {
                let mut scope = Scope::new();
                for table in &select.from {
                    self.table_with_joins(table, &mut scope)?;
                }
                let mut columns = Vec::with_capacity(select.projection.len());
                for item in &select.projection {
                    self.select_item(item, &scope, &mut columns)?;
                }
                Ok(columns)
            }
            // Every branch of a UNION has the shape of the first one.
            SetExpr::SetOperation {
                op: SetOperator::Union,
                left,
                ..
            } => self.set_expr(left),
            SetExpr::Query(query) => self.query(query),
            other => Err(ProxyError::type_discovery(format!(
                "unsupported query body: {}",
                other
            ))),
        }
    }

    fn table_with_joins(&self, table: &TableWithJoins, scope: &mut Scope) -> ProxyResult<()> {
        self.table_factor(&table.relation, scope)?;
        for join in &table.joins {
            self.table_factor(&join.relation, scope)?;
        }
        Ok(())
    }

    fn table_factor(&self, factor: &TableFactor, scope: &mut Scope) -> ProxyResult<()> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let parts = name_parts(name)?;
                let (schema, table) = match parts.as_slice() {
                    [table] => (self.default_schema, *table),
                    [schema, table] => (Some(*schema), *table),
                    _ => {
                        return Err(ProxyError::type_discovery(format!(
                            "too many namespaces in table name {}",
                            name
                        )));
                    }
                };
                let qualifier = alias
                    .as_ref()
                    .map(|alias| alias.name.value.clone())
                    .unwrap_or_else(|| table.to_string());

                let Some(schema) = schema else {
                    debug!(table, "No default schema, table columns stay untyped");
                    return Ok(());
                };
                scope.extend(
                    self.catalogue
                        .columns
                        .iter()
                        .filter(|c| {
                            c.schema.eq_ignore_ascii_case(schema)
                                && c.table.eq_ignore_ascii_case(table)
                        })
                        .map(|c| ScopeColumn {
                            qualifier: qualifier.clone(),
                            name: c.column.clone(),
                            data_type: c.data_type.clone(),
                        }),
                );
                Ok(())
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let alias = alias.as_ref().ok_or_else(|| {
                    ProxyError::type_discovery("derived table without an alias")
                })?;
                let columns = self.query(subquery)?;
                scope.extend(columns.into_iter().map(|(name, data_type)| ScopeColumn {
                    qualifier: alias.name.value.clone(),
                    name,
                    data_type,
                }));
                Ok(())
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins, scope),
            other => Err(ProxyError::type_discovery(format!(
                "unsupported table reference: {}",
                other
            ))),
        }
    }

    fn select_item(
        &self,
        item: &SelectItem,
        scope: &Scope,
        columns: &mut Vec<ResolvedColumn>,
    ) -> ProxyResult<()> {
        match item {
            SelectItem::UnnamedExpr(expr) => columns.push(self.expr(expr, scope)?),
            SelectItem::ExprWithAlias { expr, alias } => {
                let (_, data_type) = self.expr(expr, scope)?;
                columns.push((alias.value.clone(), data_type));
            }
            SelectItem::QualifiedWildcard(SelectItemQualifiedWildcardKind::ObjectName(name), _) => {
                let parts = name_parts(name)?;
                let qualifier = match parts.as_slice() {
                    [.., table] if parts.len() <= 2 => *table,
                    _ => {
                        return Err(ProxyError::type_discovery(format!(
                            "unsupported wildcard qualifier {}",
                            name
                        )));
                    }
                };
                columns.extend(
                    scope
                        .iter()
                        .filter(|c| c.qualifier.eq_ignore_ascii_case(qualifier))
                        .map(|c| (c.name.clone(), c.data_type.clone())),
                );
            }
            SelectItem::Wildcard(_) => {
                columns.extend(scope.iter().map(|c| (c.name.clone(), c.data_type.clone())))
            }
            other => {
                return Err(ProxyError::type_discovery(format!(
                    "unsupported projection: {}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn expr(&self, expr: &Expr, scope: &Scope) -> ProxyResult<ResolvedColumn> {
        match expr {
            Expr::Identifier(ident) => Ok(lookup(scope, None, &ident.value)),
            Expr::CompoundIdentifier(idents) => match idents.as_slice() {
                [.., table, column] if idents.len() <= 3 => {
                    Ok(lookup(scope, Some(table.value.as_str()), &column.value))
                }
                _ => Err(ProxyError::type_discovery(format!(
                    "unsupported identifier {}",
                    expr
                ))),
            },
            Expr::Function(function) => self.function(function, scope),
            Expr::Cast {
                expr, data_type, ..
            } => {
                let (name, _) = self.expr(expr, scope)?;
                Ok((name, Some(cast_type(data_type))))
            }
            Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
                let (name, _) = self.expr(inner, scope)?;
                Ok((name, Some("tinyint".to_string())))
            }
            Expr::Nested(inner) => self.expr(inner, scope),
            other => Ok((other.to_string(), None)),
        }
    }

    fn function(&self, function: &Function, scope: &Scope) -> ProxyResult<ResolvedColumn> {
        let name = name_parts(&function.name)?
            .last()
            .map(|part| part.to_ascii_lowercase())
            .unwrap_or_default();
        let args = function_args(function);

        match name.as_str() {
            "if" => {
                let (Some(then), Some(otherwise)) = (args.get(1), args.get(2)) else {
                    return Err(ProxyError::type_discovery("IF() needs three arguments"));
                };
                let then = self.expr(then, scope)?;
                if then.1.is_some() {
                    return Ok(then);
                }
                self.expr(otherwise, scope)
            }
            "max" | "min" | "ifnull" | "coalesce" => {
                let mut first = None;
                for arg in args {
                    let resolved = self.expr(arg, scope)?;
                    if resolved.1.is_some() {
                        return Ok(resolved);
                    }
                    first.get_or_insert(resolved);
                }
                Ok(first.unwrap_or((name, None)))
            }
            "count" => Ok((name, Some("bigint".to_string()))),
            _ => Ok((name, None)),
        }
    }
}

/// Find a column in scope, optionally restricted to one table alias.
fn lookup(scope: &Scope, qualifier: Option<&str>, column: &str) -> ResolvedColumn {
    scope
        .iter()
        .find(|c| {
            c.name.eq_ignore_ascii_case(column)
                && qualifier.is_none_or(|q| c.qualifier.eq_ignore_ascii_case(q))
        })
        .map(|c| (c.name.clone(), c.data_type.clone()))
        .unwrap_or_else(|| (column.to_string(), None))
}

fn name_parts(name: &ObjectName) -> ProxyResult<Vec<&str>> {
    name.0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(Ident { value, .. }) => Ok(value.as_str()),
            #[allow(unreachable_patterns)]
            other => Err(ProxyError::type_discovery(format!(
                "unsupported name part {}",
                other
            ))),
        })
        .collect()
}

fn function_args(function: &Function) -> Vec<&Expr> {
    match &function.args {
        FunctionArguments::List(list) => list
            .args
            .iter()
            .filter_map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Some(expr),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `DECIMAL(10,2)` → `decimal`
fn cast_type(data_type: &DataType) -> String {
    let rendered = data_type.to_string().to_ascii_lowercase();
    match rendered.split_once('(') {
        Some((base, _)) => base.trim().to_string(),
        None => rendered,
    }
}
