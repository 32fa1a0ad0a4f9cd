//! Tenant isolation for every table in the orchestration store.
//!
//! A [`TenantScope`] names the caller. Reads, updates and deletes are built
//! with [`ScopedQuery`], which appends `owner_user_id = ?` before the SQL ever
//! reaches SQLite unless the scope carries the view-all right.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::error::{OrchestratorError, Result};

/// Owner id the engine uses when it acts across tenants
pub const SYSTEM_OWNER: &str = "system";

const OWNER_COLUMN: &str = "owner_user_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    owner_user_id: String,
    can_view_all: bool,
}

impl TenantScope {
    /// Scope for a caller. An empty identity is rejected.
    pub fn new(owner_user_id: impl Into<String>, can_view_all: bool) -> Result<Self> {
        let owner_user_id = owner_user_id.into().trim().to_string();
        if owner_user_id.is_empty() {
            log::warn!("[SECURITY] Rejected request without a tenant identity");
            return Err(OrchestratorError::TenantViolation {
                requester: String::new(),
                target: "<any>".to_string(),
            });
        }
        Ok(Self {
            owner_user_id,
            can_view_all,
        })
    }

    /// Scope restricted to a single owner
    pub fn user(owner_user_id: impl Into<String>) -> Result<Self> {
        Self::new(owner_user_id, false)
    }

    /// Elevated scope used by the scheduler engine and startup sweep
    pub fn system() -> Self {
        Self {
            owner_user_id: SYSTEM_OWNER.to_string(),
            can_view_all: true,
        }
    }

    pub fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    pub fn can_view_all(&self) -> bool {
        self.can_view_all
    }

    /// Apply an explicit owner filter requested by the caller.
    ///
    /// Asking for your own rows is always allowed. Asking for somebody else's
    /// requires `can_view_all`, in which case the result is a scope pinned to
    /// that owner.
    pub fn narrow(&self, requested_owner: Option<&str>) -> Result<TenantScope> {
        match requested_owner.map(str::trim).filter(|o| !o.is_empty()) {
            None => Ok(self.clone()),
            Some(owner) if owner == self.owner_user_id => Ok(Self {
                owner_user_id: owner.to_string(),
                can_view_all: false,
            }),
            Some(owner) if self.can_view_all => Ok(Self {
                owner_user_id: owner.to_string(),
                can_view_all: false,
            }),
            Some(owner) => {
                log::warn!(
                    "[SECURITY] User '{}' attempted to access data owned by '{}'",
                    self.owner_user_id,
                    owner
                );
                Err(OrchestratorError::TenantViolation {
                    requester: self.owner_user_id.clone(),
                    target: owner.to_string(),
                })
            }
        }
    }
}

/// Builder for tenant-filtered SELECT / UPDATE / DELETE statements.
///
/// `base` is everything before the WHERE clause. Placeholders are positional
/// `?` and are bound in the order they appear: `bind` values first, then each
/// `and_where` value, then the owner filter, then LIMIT/OFFSET.
pub struct ScopedQuery<'s> {
    scope: &'s TenantScope,
    base: String,
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
    order_by: Option<String>,
    page: Option<(u32, u32)>,
}

impl<'s> ScopedQuery<'s> {
    pub fn new(scope: &'s TenantScope, base: impl Into<String>) -> Self {
        Self {
            scope,
            base: base.into(),
            clauses: Vec::new(),
            params: Vec::new(),
            order_by: None,
            page: None,
        }
    }

    /// Bind a value for a `?` in the base statement (e.g. an UPDATE's SET list)
    pub fn bind<T: ToSql + 'static>(mut self, value: T) -> Self {
        self.params.push(Box::new(value));
        self
    }

    /// Add a condition carrying exactly one `?`
    pub fn and_where<T: ToSql + 'static>(mut self, clause: &str, value: T) -> Self {
        self.clauses.push(clause.to_string());
        self.params.push(Box::new(value));
        self
    }

    /// Add a condition only when a value is present
    pub fn and_where_opt<T: ToSql + 'static>(self, clause: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.and_where(clause, v),
            None => self,
        }
    }

    /// Add a condition without parameters
    pub fn filter(mut self, clause: &str) -> Self {
        self.clauses.push(clause.to_string());
        self
    }

    pub fn order_by(mut self, order: &str) -> Self {
        self.order_by = Some(order.to_string());
        self
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.page = Some((limit, offset));
        self
    }

    fn build(&self) -> (String, Vec<&dyn ToSql>) {
        let mut sql = self.base.clone();
        let mut clauses: Vec<&str> = self.clauses.iter().map(String::as_str).collect();
        let owner_clause = format!("{} = ?", OWNER_COLUMN);
        if !self.scope.can_view_all {
            clauses.push(owner_clause.as_str());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if let Some(order) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }

        let mut params: Vec<&dyn ToSql> = self.params.iter().map(|p| p.as_ref()).collect();
        if !self.scope.can_view_all {
            params.push(&self.scope.owner_user_id);
        }
        if let Some((limit, offset)) = &self.page {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(limit);
            params.push(offset);
        }
        (sql, params)
    }

    pub fn query_map<T, F>(&self, conn: &Connection, f: F) -> rusqlite::Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let (sql, params) = self.build();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), f)?;
        rows.collect()
    }

    pub fn query_row<T, F>(&self, conn: &Connection, f: F) -> rusqlite::Result<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let (sql, params) = self.build();
        conn.query_row(&sql, params.as_slice(), f).optional()
    }

    pub fn count(&self, conn: &Connection) -> rusqlite::Result<i64> {
        let (sql, params) = self.build();
        conn.query_row(&sql, params.as_slice(), |row| row.get(0))
    }

    pub fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let (sql, params) = self.build();
        conn.execute(&sql, params.as_slice())
    }
}
