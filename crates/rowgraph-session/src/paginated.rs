//! Lists of query results resolved one page at a time.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rowgraph_core::{DataRow, Error, ObjectId, Qualifier, Result, RowQuery, Value};

use crate::context::ContextInner;
use crate::object::{ObjectRef, PersistenceState};
use crate::query::ObjectSelect;

#[derive(Clone)]
enum Element {
    /// Not resolved yet.
    Id(ObjectId),
    Object(ObjectRef),
    /// The row was gone when its page was fetched.
    Missing,
}

/// Result of [`DataContext::select_pages`](crate::DataContext::select_pages).
///
/// Holds the ids of every matching row in query order. Reading an element
/// resolves its whole page with one select; elements whose rows have been
/// deleted since the id query read as `None`.
pub struct PaginatedList {
    context: Weak<ContextInner>,
    entity: String,
    page_size: usize,
    elements: Mutex<Vec<Element>>,
}

impl std::fmt::Debug for PaginatedList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let elements = self.elements.lock();
        let unresolved = elements.iter().filter(|e| matches!(e, Element::Id(_))).count();
        f.debug_struct("PaginatedList")
            .field("entity", &self.entity)
            .field("page_size", &self.page_size)
            .field("len", &elements.len())
            .field("unresolved", &unresolved)
            .finish()
    }
}

impl PaginatedList {
    pub(crate) fn fetch(inner: &Arc<ContextInner>, select: &ObjectSelect) -> Result<Self> {
        let page_size = select
            .page_size
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::state(None, "a paginated select needs a page size above zero"))?;
        if select.fetch_data_rows {
            return Err(Error::state(None, "a paginated select must return objects"));
        }

        let elements = if inner.parent.is_some() {
            // pages of a child would be fetched through the parent anyway
            let objects = inner.with_store(|store| inner.perform_query_in(store, select))?;
            objects.into_objects().into_iter().map(Element::Object).collect()
        } else {
            Self::fetch_ids(inner, select)?
        };

        let list = Self {
            context: Arc::downgrade(inner),
            entity: select.entity.clone(),
            page_size,
            elements: Mutex::new(elements),
        };
        list.resolve_page(inner, 0)?;
        tracing::debug!(entity = %list.entity, len = list.len(), page_size, "Fetched paginated list");
        Ok(list)
    }

    /// Ids of the matching rows; already registered objects are used as is.
    fn fetch_ids(inner: &Arc<ContextInner>, select: &ObjectSelect) -> Result<Vec<Element>> {
        let entity = inner.entity(&select.entity)?;
        let mut columns = entity.pk_columns.clone();
        columns.extend(inner.resolver.discriminator_columns(&entity.name));
        let mut query = RowQuery::new(
            entity.table.clone(),
            select
                .qualifier
                .clone()
                .and(inner.resolver.entity_qualifier(&entity.name)),
        )
        .project(columns);
        query.ordering = select.ordering.clone();
        query.limit = select.limit;
        query.offset = select.offset;
        let rows = inner.executor.select(&query)?;

        inner.with_store(|store| {
            rows.iter()
                .map(|row| {
                    let leaf = inner.resolver.leaf_entity(&entity.name, row)?;
                    let id = inner.id_for_row(leaf, row)?;
                    Ok(match store.get_node(&id) {
                        Some(object) if object.persistence_state() != PersistenceState::Hollow => {
                            Element::Object(object)
                        }
                        _ => Element::Id(id),
                    })
                })
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.elements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Element at `index`, resolving its page if needed. `None` past the end
    /// or for a row deleted since the list was fetched.
    pub fn get(&self, index: usize) -> Result<Option<ObjectRef>> {
        if index >= self.len() {
            return Ok(None);
        }
        let needs_page = matches!(self.elements.lock().get(index), Some(Element::Id(_)));
        if needs_page {
            let context = self.context()?;
            self.resolve_page(&context, index / self.page_size)?;
        }
        Ok(match self.elements.lock().get(index) {
            Some(Element::Object(object)) => Some(Arc::clone(object)),
            _ => None,
        })
    }

    /// Every element, resolving the pages not read yet.
    pub fn to_vec(&self) -> Result<Vec<ObjectRef>> {
        let pages = self.len().div_ceil(self.page_size);
        if pages > 0 {
            let context = self.context()?;
            for page in 0..pages {
                self.resolve_page(&context, page)?;
            }
        }
        Ok(self
            .elements
            .lock()
            .iter()
            .filter_map(|e| match e {
                Element::Object(object) => Some(Arc::clone(object)),
                _ => None,
            })
            .collect())
    }

    fn context(&self) -> Result<Arc<ContextInner>> {
        self.context
            .upgrade()
            .ok_or_else(|| Error::state(None, "the list's context has been dropped"))
    }

    /// Fetch the unresolved elements of `page` with one select.
    fn resolve_page(&self, context: &Arc<ContextInner>, page: usize) -> Result<()> {
        let wanted: Vec<(usize, ObjectId)> = {
            let elements = self.elements.lock();
            let start = page * self.page_size;
            let end = (start + self.page_size).min(elements.len());
            (start..end)
                .filter_map(|i| match &elements[i] {
                    Element::Id(id) => Some((i, id.clone())),
                    _ => None,
                })
                .collect()
        };
        if wanted.is_empty() {
            return Ok(());
        }

        let base = context.entity(&self.entity)?;
        let columns = base.pk_columns.clone();
        let tuples: Vec<Vec<Value>> = wanted
            .iter()
            .map(|(_, id)| {
                columns
                    .iter()
                    .map(|c| id.key_value(c).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        let qualifier = Qualifier::In { columns, tuples }.and(context.resolver.entity_qualifier(&base.name));
        let rows: Vec<DataRow> = context
            .executor
            .select(&RowQuery::new(base.table.clone(), qualifier))?
            .iter()
            .map(DataRow::root_columns)
            .collect();
        let objects = context.with_store(|store| context.objects_from_rows(store, &base, &rows, false))?;

        let mut elements = self.elements.lock();
        for (index, id) in wanted {
            let found = objects
                .iter()
                .find(|o| o.object_id().is_some_and(|oid| oid.key_values() == id.key_values()));
            elements[index] = match found {
                Some(object) => Element::Object(Arc::clone(object)),
                None => Element::Missing,
            };
        }
        tracing::trace!(entity = %self.entity, page, rows = rows.len(), "Resolved page");
        Ok(())
    }
}
