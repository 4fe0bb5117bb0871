//! Commit: turning pending changes into ordered DML batches.
//!
//! Statements run in one transaction, in this order:
//!
//! 1. INSERT, referenced tables first; rows of one table that reference each
//!    other are ordered so a parent precedes its children
//! 2. link-table INSERT for flattened relationships
//! 3. UPDATE, in the order objects were first changed
//! 4. link-table DELETE
//! 5. DELETE, referencing tables first, children before parents
//!
//! Consecutive statements with the same table and column layout share a
//! batch. Nothing in the object graph changes until the transaction commits.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rowgraph_cache::SnapshotChanges;
use rowgraph_core::{
    BatchOperation, DataRow, DeleteBatch, Discriminator, EntityInfo, Error, InsertBatch, ObjectId,
    OptimisticLockFailure, RelationshipInfo, Result, UpdateBatch, UpdateRow, Value,
};

use crate::context::ContextInner;
use crate::lifecycle::LifecycleEvent;
use crate::object::{self, ObjectRef, PersistenceState, ToManySlot, ToOneSlot, is_live};
use crate::object_store::ObjectStore;

/// A pending statement against an entity table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingOp {
    Insert {
        id: ObjectId,
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        id: ObjectId,
        table: String,
        set_columns: Vec<String>,
        set_values: Vec<Value>,
        /// Primary key plus lock columns
        where_columns: Vec<String>,
        /// Values of `where_columns` in the baseline row
        predicate: Vec<Value>,
    },
    Delete {
        id: ObjectId,
        table: String,
        where_columns: Vec<String>,
        predicate: Vec<Value>,
    },
}

impl PendingOp {
    pub(crate) fn table(&self) -> &str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    pub(crate) fn id(&self) -> &ObjectId {
        match self {
            PendingOp::Insert { id, .. } | PendingOp::Update { id, .. } | PendingOp::Delete { id, .. } => id,
        }
    }

    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            PendingOp::Insert { .. } => "INSERT",
            PendingOp::Update { .. } => "UPDATE",
            PendingOp::Delete { .. } => "DELETE",
        }
    }

    /// UPDATE and DELETE must each hit exactly one row.
    const fn is_guarded(&self) -> bool {
        !matches!(self, PendingOp::Insert { .. })
    }

    /// True if both statements can share one batch.
    fn same_layout(&self, other: &PendingOp) -> bool {
        match (self, other) {
            (
                PendingOp::Insert { table, columns, .. },
                PendingOp::Insert {
                    table: other_table,
                    columns: other_columns,
                    ..
                },
            ) => table == other_table && columns == other_columns,
            (
                PendingOp::Update {
                    table,
                    set_columns,
                    where_columns,
                    ..
                },
                PendingOp::Update {
                    table: other_table,
                    set_columns: other_set,
                    where_columns: other_where,
                    ..
                },
            ) => table == other_table && set_columns == other_set && where_columns == other_where,
            (
                PendingOp::Delete {
                    table, where_columns, ..
                },
                PendingOp::Delete {
                    table: other_table,
                    where_columns: other_where,
                    ..
                },
            ) => table == other_table && where_columns == other_where,
            _ => false,
        }
    }

    /// Column values the statement expects to find in the row.
    fn expected(&self) -> BTreeMap<String, Value> {
        match self {
            PendingOp::Insert { .. } => BTreeMap::new(),
            PendingOp::Update {
                where_columns,
                predicate,
                ..
            }
            | PendingOp::Delete {
                where_columns,
                predicate,
                ..
            } => where_columns.iter().cloned().zip(predicate.iter().cloned()).collect(),
        }
    }
}

/// A pending link-table row change of a flattened relationship.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkTableOp {
    Link {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Unlink {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
}

impl LinkTableOp {
    pub(crate) const fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link { .. })
    }

    fn parts(&self) -> (&str, &[String], &[Value]) {
        match self {
            LinkTableOp::Link {
                table,
                columns,
                values,
            }
            | LinkTableOp::Unlink {
                table,
                columns,
                values,
            } => (table, columns, values),
        }
    }
}

/// Everything one commit writes, plus what the snapshot cache learns from
/// it.
#[derive(Debug, Default)]
pub(crate) struct CommitPlan {
    pub(crate) inserts: Vec<PendingOp>,
    pub(crate) links: Vec<LinkTableOp>,
    pub(crate) updates: Vec<PendingOp>,
    pub(crate) unlinks: Vec<LinkTableOp>,
    pub(crate) deletes: Vec<PendingOp>,
    /// Rows as they will be after the commit, by permanent id
    pub(crate) snapshots: Vec<(ObjectId, DataRow)>,
    /// Objects whose to-many relationships changed through the other side
    pub(crate) indirectly_modified: Vec<ObjectId>,
}

impl CommitPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of row statements.
    pub(crate) fn len(&self) -> usize {
        self.inserts.len() + self.links.len() + self.updates.len() + self.unlinks.len() + self.deletes.len()
    }

    /// Batches in execution order.
    fn batches(&self) -> Vec<PlannedBatch<'_>> {
        let mut batches = Vec::new();
        push_entity_batches(&self.inserts, &mut batches);
        for operation in link_batches(&self.links) {
            batches.push(PlannedBatch {
                operation,
                ops: Vec::new(),
            });
        }
        push_entity_batches(&self.updates, &mut batches);
        for operation in link_batches(&self.unlinks) {
            batches.push(PlannedBatch {
                operation,
                ops: Vec::new(),
            });
        }
        push_entity_batches(&self.deletes, &mut batches);
        batches
    }
}

/// A batch and the entity statements behind its rows, in row order.
struct PlannedBatch<'a> {
    operation: BatchOperation,
    /// Empty for link-table batches, whose row counts are not checked.
    ops: Vec<&'a PendingOp>,
}

/// Group consecutive statements sharing a layout.
pub(crate) fn batch_by_layout(ops: &[PendingOp]) -> Vec<Vec<&PendingOp>> {
    let mut batches: Vec<Vec<&PendingOp>> = Vec::new();
    for op in ops {
        match batches.last_mut() {
            Some(batch) if batch.first().is_some_and(|first| first.same_layout(op)) => batch.push(op),
            _ => batches.push(vec![op]),
        }
    }
    batches
}

fn push_entity_batches<'a>(ops: &'a [PendingOp], batches: &mut Vec<PlannedBatch<'a>>) {
    for group in batch_by_layout(ops) {
        if let Some(operation) = entity_batch(&group) {
            batches.push(PlannedBatch { operation, ops: group });
        }
    }
}

fn entity_batch(ops: &[&PendingOp]) -> Option<BatchOperation> {
    let first = ops.first()?;
    let operation = match first {
        PendingOp::Insert { table, columns, .. } => BatchOperation::Insert(InsertBatch {
            table: table.clone(),
            columns: columns.clone(),
            rows: ops
                .iter()
                .filter_map(|op| match op {
                    PendingOp::Insert { values, .. } => Some(values.clone()),
                    _ => None,
                })
                .collect(),
        }),
        PendingOp::Update {
            table,
            set_columns,
            where_columns,
            ..
        } => BatchOperation::Update(UpdateBatch {
            table: table.clone(),
            set_columns: set_columns.clone(),
            where_columns: where_columns.clone(),
            rows: ops
                .iter()
                .filter_map(|op| match op {
                    PendingOp::Update {
                        set_values,
                        predicate,
                        ..
                    } => Some(UpdateRow {
                        values: set_values.clone(),
                        predicate: predicate.clone(),
                    }),
                    _ => None,
                })
                .collect(),
        }),
        PendingOp::Delete {
            table, where_columns, ..
        } => BatchOperation::Delete(DeleteBatch {
            table: table.clone(),
            where_columns: where_columns.clone(),
            rows: ops
                .iter()
                .filter_map(|op| match op {
                    PendingOp::Delete { predicate, .. } => Some(predicate.clone()),
                    _ => None,
                })
                .collect(),
        }),
    };
    Some(operation)
}

fn link_batches(ops: &[LinkTableOp]) -> Vec<BatchOperation> {
    let mut batches: Vec<BatchOperation> = Vec::new();
    for op in ops {
        let (table, columns, values) = op.parts();
        if let Some(last) = batches.last_mut() {
            match (last, op.is_link()) {
                (BatchOperation::Insert(batch), true) if batch.table == table && batch.columns == columns => {
                    batch.rows.push(values.to_vec());
                    continue;
                }
                (BatchOperation::Delete(batch), false)
                    if batch.table == table && batch.where_columns == columns =>
                {
                    batch.rows.push(values.to_vec());
                    continue;
                }
                _ => {}
            }
        }
        batches.push(if op.is_link() {
            BatchOperation::Insert(InsertBatch {
                table: table.to_string(),
                columns: columns.to_vec(),
                rows: vec![values.to_vec()],
            })
        } else {
            BatchOperation::Delete(DeleteBatch {
                table: table.to_string(),
                where_columns: columns.to_vec(),
                rows: vec![values.to_vec()],
            })
        });
    }
    batches
}

/// Order `remaining` so that every item follows the items it depends on,
/// keeping the given order otherwise. Cycles are broken at the first
/// remaining item.
fn dependency_order(mut remaining: Vec<usize>, deps: &HashMap<usize, Vec<usize>>) -> Vec<usize> {
    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|i| {
                deps.get(i)
                    .is_none_or(|needs| needs.iter().all(|j| !remaining.contains(j)))
            })
            .unwrap_or(0);
        order.push(remaining.remove(ready));
    }
    order
}

/// A pending object as seen when the commit started.
pub(crate) struct Pending {
    pub(crate) object: ObjectRef,
    pub(crate) id: ObjectId,
    pub(crate) entity: Arc<EntityInfo>,
    pub(crate) state: PersistenceState,
    baseline: Option<Arc<DataRow>>,
    /// Attributes that still differ from the baseline
    pub(crate) modified_attributes: Vec<String>,
    pub(crate) modified_to_one: BTreeSet<String>,
    touched_to_many: bool,
}

impl Pending {
    fn baseline_value(&self, column: &str) -> Value {
        self.baseline
            .as_ref()
            .and_then(|row| row.get(column).cloned())
            .unwrap_or(Value::Null)
    }
}

/// Permanent ids assigned to NEW objects during one commit.
#[derive(Default)]
struct KeyMap(HashMap<ObjectId, ObjectId>);

impl KeyMap {
    fn resolve(&self, id: &ObjectId) -> ObjectId {
        self.0.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Permanent id of `object`, `None` if it has none yet.
    fn permanent(&self, object: &ObjectRef) -> Option<ObjectId> {
        let id = object.object_id()?;
        if id.is_temporary() {
            self.0.get(&id).cloned()
        } else {
            Some(id)
        }
    }
}

/// Target of a resolved to-one; `None` while the slot is a fault.
fn resolved_to_one(object: &ObjectRef, relationship: &str) -> Option<Option<ObjectRef>> {
    match object.read().to_one.get(relationship) {
        Some(ToOneSlot::Resolved(target)) => Some(target.clone()),
        _ => None,
    }
}

fn position(pending: &[Pending], object: &ObjectRef) -> Option<usize> {
    pending.iter().position(|p| object::same(&p.object, object))
}

impl ContextInner {
    /// Write every pending change of `store` in one transaction.
    ///
    /// On failure the transaction is rolled back and the object graph is
    /// left exactly as it was, changes included.
    pub(crate) fn commit_in(&self, store: &mut ObjectStore) -> Result<()> {
        let pending = Self::collect_pending(store);
        let inserts = self.insert_order(&pending);
        let deletes = self.delete_order(&pending);
        let keys = self.assign_keys(&pending, &inserts).map_err(Error::commit_aborted)?;
        let plan = self
            .plan(store, &pending, &inserts, &deletes, &keys)
            .map_err(Error::commit_aborted)?;
        if !plan.is_empty() {
            self.execute(&plan).map_err(Error::commit_aborted)?;
        }
        self.finish_commit(store, &pending, &keys, plan);
        Ok(())
    }

    pub(crate) fn collect_pending(store: &ObjectStore) -> Vec<Pending> {
        store
            .pending()
            .into_iter()
            .filter_map(|diff| {
                let data = diff.object.read();
                let id = data.id.clone()?;
                let modified_attributes = diff
                    .modified_attributes
                    .iter()
                    .filter(|p| diff.is_attribute_modified(&data, p))
                    .cloned()
                    .collect();
                Some(Pending {
                    object: Arc::clone(&diff.object),
                    id,
                    entity: Arc::clone(&data.entity),
                    state: data.state,
                    baseline: diff.baseline.clone(),
                    modified_attributes,
                    modified_to_one: diff.modified_to_one.clone(),
                    touched_to_many: !diff.touched_to_many.is_empty(),
                })
            })
            .collect()
    }

    /// NEW objects, parents before children.
    fn insert_order(&self, pending: &[Pending]) -> Vec<usize> {
        let mut new: Vec<usize> = (0..pending.len())
            .filter(|&i| pending[i].state == PersistenceState::New)
            .collect();
        new.sort_by_key(|&i| (self.resolver.table_rank(&pending[i].entity.table), i));

        let mut deps: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &new {
            for rel in pending[i].entity.fk_relationships() {
                let Some(Some(target)) = resolved_to_one(&pending[i].object, &rel.name) else {
                    continue;
                };
                if let Some(j) = position(pending, &target) {
                    if j != i && pending[j].state == PersistenceState::New {
                        deps.entry(i).or_default().push(j);
                    }
                }
            }
        }
        dependency_order(new, &deps)
    }

    /// DELETED objects, children before parents. Dependencies come from the
    /// baseline rows, which is what the database still holds.
    fn delete_order(&self, pending: &[Pending]) -> Vec<usize> {
        let mut deleted: Vec<usize> = (0..pending.len())
            .filter(|&i| pending[i].state == PersistenceState::Deleted)
            .collect();
        deleted.sort_by_key(|&i| (Reverse(self.resolver.table_rank(&pending[i].entity.table)), i));

        let mut deps: HashMap<usize, Vec<usize>> = HashMap::new();
        for &child in &deleted {
            let Some(baseline) = &pending[child].baseline else {
                continue;
            };
            for rel in pending[child].entity.fk_relationships() {
                let Some(parent_id) = self.fk_target_id(rel, baseline) else {
                    continue;
                };
                let parent = deleted.iter().copied().find(|&i| {
                    i != child
                        && pending[i].id.key_values() == parent_id.key_values()
                        && self
                            .resolver
                            .is_kind_of(pending[i].id.entity_name(), parent_id.entity_name())
                });
                if let Some(parent) = parent {
                    deps.entry(parent).or_default().push(child);
                }
            }
        }
        dependency_order(deleted, &deps)
    }

    /// Permanent ids for NEW objects, taken from a meaningful key attribute,
    /// propagated from a to-one target, or generated.
    fn assign_keys(&self, pending: &[Pending], order: &[usize]) -> Result<KeyMap> {
        let mut keys = KeyMap::default();
        for &i in order {
            let p = &pending[i];
            if !p.id.is_temporary() {
                continue;
            }
            let mut key = BTreeMap::new();
            for column in &p.entity.pk_columns {
                let value = match Self::meaningful_pk(p, column).or_else(|| Self::propagated_pk(p, column, &keys)) {
                    Some(value) => value,
                    None => self.pk_generator.generate(&p.entity, column)?,
                };
                key.insert(column.clone(), value);
            }
            tracing::trace!(entity = %p.entity.name, key = ?key, "Assigned primary key");
            keys.0
                .insert(p.id.clone(), ObjectId::new(p.entity.name.clone(), key));
        }
        Ok(keys)
    }

    fn meaningful_pk(p: &Pending, column: &str) -> Option<Value> {
        let attr = p.entity.attribute_for_column(column)?;
        p.object
            .read()
            .values
            .get(&attr.name)
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn propagated_pk(p: &Pending, column: &str, keys: &KeyMap) -> Option<Value> {
        p.entity.fk_relationships().find_map(|rel| {
            let pair = rel.first_step()?.pairs.iter().find(|pair| pair.source == column)?;
            let target = resolved_to_one(&p.object, &rel.name)??;
            keys.permanent(&target)?.key_value(&pair.target).cloned()
        })
    }

    /// FK column values of a to-one as they should be written. A faulted
    /// to-one keeps its baseline values.
    fn fk_values(p: &Pending, rel: &RelationshipInfo, keys: &KeyMap) -> Vec<(String, Value)> {
        let Some(step) = rel.first_step() else {
            return Vec::new();
        };
        match resolved_to_one(&p.object, &rel.name) {
            Some(Some(target)) => {
                let target_id = keys.permanent(&target);
                step.pairs
                    .iter()
                    .map(|pair| {
                        let value = target_id
                            .as_ref()
                            .and_then(|id| id.key_value(&pair.target))
                            .cloned()
                            .unwrap_or(Value::Null);
                        (pair.source.clone(), value)
                    })
                    .collect()
            }
            Some(None) => step
                .pairs
                .iter()
                .map(|pair| (pair.source.clone(), Value::Null))
                .collect(),
            None => step
                .pairs
                .iter()
                .map(|pair| (pair.source.clone(), p.baseline_value(&pair.source)))
                .collect(),
        }
    }

    fn plan(
        &self,
        store: &ObjectStore,
        pending: &[Pending],
        inserts: &[usize],
        deletes: &[usize],
        keys: &KeyMap,
    ) -> Result<CommitPlan> {
        let mut plan = CommitPlan::default();

        for &i in inserts {
            let p = &pending[i];
            let id = keys.resolve(&p.id);
            let row = Self::insert_row(p, &id, keys);
            let (columns, values) = row
                .iter()
                .map(|(column, value)| (column.to_string(), value.clone()))
                .unzip();
            plan.inserts.push(PendingOp::Insert {
                id: id.clone(),
                table: p.entity.table.clone(),
                columns,
                values,
            });
            plan.snapshots.push((id, row));
        }

        for p in pending.iter().filter(|p| p.state == PersistenceState::Modified) {
            if let Some((op, row)) = Self::update(p, keys) {
                plan.updates.push(op);
                plan.snapshots.push((p.id.clone(), row));
            }
        }

        for &i in deletes {
            let p = &pending[i];
            let (where_columns, predicate) = Self::predicate(p);
            plan.deletes.push(PendingOp::Delete {
                id: p.id.clone(),
                table: p.entity.table.clone(),
                where_columns,
                predicate,
            });
        }

        let mut indirect: Vec<ObjectId> = Vec::new();
        for arc in store.flattened() {
            if arc.added && !(is_live(&arc.source) && is_live(&arc.target)) {
                continue;
            }
            let (Some(source_id), Some(target_id)) = (keys.permanent(&arc.source), keys.permanent(&arc.target))
            else {
                continue;
            };
            let entity = arc.source.entity();
            let rel = self.relationship(&entity, &arc.relationship)?;
            let [to_link, to_target] = rel.joins.as_slice() else {
                return Err(Error::metadata(
                    Some(&entity.name),
                    format!(
                        "relationship '{}' spans {} joins; only link-table relationships can be written",
                        rel.name,
                        rel.joins.len()
                    ),
                ));
            };
            let mut columns = Vec::new();
            let mut values = Vec::new();
            for pair in &to_link.pairs {
                columns.push(pair.target.clone());
                values.push(source_id.key_value(&pair.source).cloned().unwrap_or(Value::Null));
            }
            for pair in &to_target.pairs {
                columns.push(pair.source.clone());
                values.push(target_id.key_value(&pair.target).cloned().unwrap_or(Value::Null));
            }
            let table = to_link.target_table.clone();
            if arc.added {
                plan.links.push(LinkTableOp::Link { table, columns, values });
            } else {
                plan.unlinks.push(LinkTableOp::Unlink { table, columns, values });
            }
            indirect.push(source_id);
            indirect.push(target_id);
        }

        indirect.extend(self.indirect_targets(pending, keys));
        let deleted: HashSet<&ObjectId> = deletes.iter().map(|&i| &pending[i].id).collect();
        let mut seen = HashSet::new();
        plan.indirectly_modified = indirect
            .into_iter()
            .filter(|id| !deleted.contains(id) && seen.insert(id.clone()))
            .collect();
        Ok(plan)
    }

    fn insert_row(p: &Pending, id: &ObjectId, keys: &KeyMap) -> DataRow {
        let mut row = DataRow::new();
        for (column, value) in id.key_values() {
            row.insert(column.clone(), value.clone());
        }
        let values = p.object.read().values.clone();
        for attr in &p.entity.attributes {
            if row.contains_column(&attr.column) {
                continue;
            }
            row.insert(attr.column.clone(), values.get(&attr.name).cloned().unwrap_or(Value::Null));
        }
        for rel in p.entity.fk_relationships() {
            for (column, value) in Self::fk_values(p, rel, keys) {
                if !row.contains_column(&column) {
                    row.insert(column, value);
                }
            }
        }
        if let Some(Discriminator::Value { column, value }) = &p.entity.discriminator {
            if !row.contains_column(column) {
                row.insert(column.clone(), value.clone());
            }
        }
        row
    }

    /// UPDATE for a MODIFIED object and the row it leaves behind; `None`
    /// when no column actually changed.
    fn update(p: &Pending, keys: &KeyMap) -> Option<(PendingOp, DataRow)> {
        let mut changes = BTreeMap::new();
        {
            let data = p.object.read();
            for name in &p.modified_attributes {
                let Some(attr) = p.entity.attribute_info(name) else {
                    continue;
                };
                if p.entity.is_pk_column(&attr.column) {
                    continue;
                }
                changes.insert(
                    attr.column.clone(),
                    data.values.get(name).cloned().unwrap_or(Value::Null),
                );
            }
        }
        for rel in p
            .entity
            .fk_relationships()
            .filter(|rel| p.modified_to_one.contains(&rel.name))
        {
            for (column, value) in Self::fk_values(p, rel, keys) {
                if !p.entity.is_pk_column(&column) && !value.matches(&p.baseline_value(&column)) {
                    changes.insert(column, value);
                }
            }
        }
        if changes.is_empty() {
            return None;
        }

        let row = match &p.baseline {
            Some(baseline) => baseline.apply_diff(&changes),
            None => DataRow::from_pairs(changes.clone()),
        };
        let (where_columns, predicate) = Self::predicate(p);
        let (set_columns, set_values) = changes.into_iter().unzip();
        let op = PendingOp::Update {
            id: p.id.clone(),
            table: p.entity.table.clone(),
            set_columns,
            set_values,
            where_columns,
            predicate,
        };
        Some((op, row))
    }

    /// Primary key plus lock columns, valued from the baseline.
    fn predicate(p: &Pending) -> (Vec<String>, Vec<Value>) {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (column, value) in p.id.key_values() {
            columns.push(column.clone());
            values.push(value.clone());
        }
        for column in p.entity.lock_columns() {
            values.push(p.baseline_value(&column));
            columns.push(column);
        }
        (columns, values)
    }

    /// Objects on the other side of changed FK relationships, plus objects
    /// whose own to-many lists were touched.
    fn indirect_targets(&self, pending: &[Pending], keys: &KeyMap) -> Vec<ObjectId> {
        let mut ids = Vec::new();
        for p in pending {
            if p.touched_to_many && p.state != PersistenceState::Deleted {
                ids.push(keys.resolve(&p.id));
            }
            for rel in p.entity.fk_relationships().filter(|rel| rel.reverse.is_some()) {
                let current = || {
                    resolved_to_one(&p.object, &rel.name)
                        .flatten()
                        .and_then(|target| keys.permanent(&target))
                };
                let previous = || p.baseline.as_ref().and_then(|row| self.fk_target_id(rel, row));
                match p.state {
                    PersistenceState::New => ids.extend(current()),
                    PersistenceState::Deleted => ids.extend(previous()),
                    PersistenceState::Modified if p.modified_to_one.contains(&rel.name) => {
                        ids.extend(current());
                        ids.extend(previous());
                    }
                    _ => {}
                }
            }
        }
        ids
    }

    fn execute(&self, plan: &CommitPlan) -> Result<()> {
        let batches = plan.batches();
        let mut tx = self.executor.begin()?;
        for batch in &batches {
            tracing::trace!(
                table = batch.operation.table(),
                rows = batch.operation.row_count(),
                "Executing batch"
            );
            let counts = match tx.execute(&batch.operation) {
                Ok(counts) => counts,
                Err(e) => {
                    if let Err(rollback) = tx.rollback() {
                        tracing::warn!(error = %rollback, "Rollback after failed batch also failed");
                    }
                    return Err(e);
                }
            };
            let missed = batch
                .ops
                .iter()
                .zip(&counts)
                .find(|(op, count)| op.is_guarded() && **count == 0)
                .map(|(op, _)| *op);
            if let Some(op) = missed {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "Rollback after lock failure also failed");
                }
                return Err(self.lock_failure(op));
            }
        }
        tx.commit()
    }

    fn lock_failure(&self, op: &PendingOp) -> Error {
        let id = op.id();
        let fresh_snapshot = match self.entity(id.entity_name()) {
            Ok(entity) => self.fetch_row(&entity, id).unwrap_or_else(|e| {
                tracing::warn!(id = %id, error = %e, "Could not re-read row after lock failure");
                None
            }),
            Err(_) => None,
        };
        tracing::warn!(
            id = %id,
            table = op.table(),
            operation = op.kind(),
            deleted = fresh_snapshot.is_none(),
            "Optimistic lock failure"
        );
        Error::OptimisticLock(OptimisticLockFailure {
            object_id: id.clone(),
            expected: op.expected(),
            operation: op.kind(),
            table: op.table().to_string(),
            fresh_snapshot,
        })
    }

    /// Make the committed state current: permanent ids, COMMITTED states,
    /// no pending changes, and the snapshot cache told what changed.
    fn finish_commit(&self, store: &mut ObjectStore, pending: &[Pending], keys: &KeyMap, plan: CommitPlan) {
        let versions: HashMap<&ObjectId, u64> = plan.snapshots.iter().map(|(id, row)| (id, row.version())).collect();
        let mut deleted_objects = Vec::new();
        let mut deleted_ids = Vec::new();
        for p in pending {
            match p.state {
                PersistenceState::New => {
                    let id = keys.resolve(&p.id);
                    if id != p.id {
                        store.rekey(&p.id, id.clone());
                    }
                    let mut data = p.object.write();
                    for attr in p.entity.pk_attributes() {
                        if let Some(value) = id.key_value(&attr.column) {
                            data.values.insert(attr.name.clone(), value.clone());
                        }
                    }
                    data.snapshot_version = versions.get(&id).copied();
                    data.id = Some(id);
                    data.state = PersistenceState::Committed;
                    self.queue_callback(LifecycleEvent::PostPersist, &p.object);
                }
                PersistenceState::Modified => {
                    let mut data = p.object.write();
                    if let Some(version) = versions.get(&p.id) {
                        data.snapshot_version = Some(*version);
                    }
                    data.state = PersistenceState::Committed;
                    self.queue_callback(LifecycleEvent::PostUpdate, &p.object);
                }
                PersistenceState::Deleted => {
                    deleted_objects.push(Arc::clone(&p.object));
                    deleted_ids.push(p.id.clone());
                }
                _ => {}
            }
            let mut data = p.object.write();
            for slot in data.to_many.values_mut() {
                if let ToManySlot::Fault { added, removed } = slot {
                    added.clear();
                    removed.clear();
                }
            }
        }
        store.clear_changes();
        store.unregister_nodes(&deleted_objects);
        for object in &deleted_objects {
            self.queue_callback(LifecycleEvent::PostRemove, object);
        }

        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            links = plan.links.len() + plan.unlinks.len(),
            "Committed changes"
        );
        self.snapshots.process_changes(
            self.subscriber(),
            SnapshotChanges {
                updated: plan.snapshots,
                deleted: deleted_ids,
                invalidated: Vec::new(),
                indirectly_modified: plan.indirectly_modified,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectSelect;
    use crate::testing::{gallery, seed_artists, seed_painting};
    use rowgraph_core::{OrderBy, Qualifier};

    fn insert(table: &str, columns: &[&str]) -> PendingOp {
        PendingOp::Insert {
            id: ObjectId::temporary("Artist"),
            table: table.to_string(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            values: vec![Value::Null; columns.len()],
        }
    }

    #[test]
    fn test_batch_by_layout_groups_consecutive_statements() {
        let ops = vec![
            insert("ARTIST", &["ARTIST_ID", "ARTIST_NAME"]),
            insert("ARTIST", &["ARTIST_ID", "ARTIST_NAME"]),
            insert("PAINTING", &["PAINTING_ID"]),
            insert("ARTIST", &["ARTIST_ID"]),
        ];
        let batches = batch_by_layout(&ops);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1][0].table(), "PAINTING");
        assert_eq!(batches[2][0].table(), "ARTIST");
    }

    #[test]
    fn test_link_batches_split_by_kind() {
        let link = |values: i64| LinkTableOp::Link {
            table: "ARTIST_GROUP".to_string(),
            columns: vec!["ARTIST_ID".to_string(), "GROUP_ID".to_string()],
            values: vec![Value::BigInt(values), Value::BigInt(1)],
        };
        let unlink = LinkTableOp::Unlink {
            table: "ARTIST_GROUP".to_string(),
            columns: vec!["ARTIST_ID".to_string(), "GROUP_ID".to_string()],
            values: vec![Value::BigInt(3), Value::BigInt(1)],
        };
        let batches = link_batches(&[link(1), link(2), unlink]);
        assert_eq!(batches.len(), 2);
        assert!(matches!(&batches[0], BatchOperation::Insert(b) if b.rows.len() == 2));
        assert!(matches!(&batches[1], BatchOperation::Delete(b) if b.rows.len() == 1));
    }

    #[test]
    fn test_dependency_order_puts_dependencies_first() {
        let mut deps = HashMap::new();
        deps.insert(0, vec![2]);
        deps.insert(2, vec![1]);
        assert_eq!(dependency_order(vec![0, 1, 2], &deps), vec![1, 2, 0]);

        // a cycle still yields every item
        let mut cycle = HashMap::new();
        cycle.insert(0, vec![1]);
        cycle.insert(1, vec![0]);
        assert_eq!(dependency_order(vec![0, 1], &cycle), vec![0, 1]);
    }

    #[test]
    fn test_commit_assigns_permanent_id() {
        let fixture = gallery();
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        artist.write_property("name", "Monet").unwrap();
        let temp = artist.object_id().unwrap();
        assert!(temp.is_temporary());

        context.commit_changes().unwrap();

        let id = artist.object_id().unwrap();
        assert!(!id.is_temporary());
        assert_eq!(id.key_value("ARTIST_ID"), Some(&Value::BigInt(200)));
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
        assert!(context.get_node(&temp).is_none());
        assert!(Arc::ptr_eq(&context.get_node(&id).unwrap(), &artist));
        assert!(!context.has_changes());

        let rows = fixture.db.rows("ARTIST");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("ARTIST_NAME"), Some(&Value::from("Monet")));
        let snapshot = context.get_cached_snapshot(&id).unwrap();
        assert_eq!(Some(snapshot.version()), artist.snapshot_version());
    }

    #[test]
    fn test_parent_is_inserted_before_child() {
        let fixture = gallery();
        let context = fixture.context();
        let painting = context.new_object("Painting").unwrap();
        painting.write_property("title", "Sunflowers").unwrap();
        let artist = context.new_object("Artist").unwrap();
        artist.write_property("name", "van Gogh").unwrap();
        painting.set_to_one("artist", Some(&artist)).unwrap();

        context.commit_changes().unwrap();

        let tables: Vec<String> = fixture.db.batches().iter().map(|b| b.table().to_string()).collect();
        assert_eq!(tables, vec!["ARTIST", "PAINTING"]);
        let rows = fixture.db.rows("PAINTING");
        assert_eq!(
            rows[0].get("ARTIST_ID"),
            artist.object_id().unwrap().key_value("ARTIST_ID")
        );
        assert_eq!(rows[0].get("KIND"), Some(&Value::from("P")));
    }

    #[test]
    fn test_inserts_of_one_table_share_a_batch() {
        let fixture = gallery();
        let context = fixture.context();
        for name in ["Monet", "Manet"] {
            let artist = context.new_object("Artist").unwrap();
            artist.write_property("name", name).unwrap();
        }
        context.commit_changes().unwrap();

        let batches = fixture.db.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].row_count(), 2);
    }

    #[test]
    fn test_update_sets_changed_columns_and_locks_on_baseline() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        artist.write_property("name", "Claude Monet").unwrap();

        context.commit_changes().unwrap();

        let batches = fixture.db.batches();
        let BatchOperation::Update(update) = &batches[0] else {
            panic!("expected an update, got {:?}", batches[0]);
        };
        assert_eq!(update.set_columns, vec!["ARTIST_NAME"]);
        assert_eq!(update.where_columns, vec!["ARTIST_ID", "ARTIST_NAME"]);
        assert_eq!(
            update.rows[0].predicate,
            vec![Value::BigInt(1), Value::from("Monet")]
        );
        assert_eq!(artist.persistence_state(), PersistenceState::Committed);
        assert_eq!(
            fixture.db.rows("ARTIST")[0].get("ARTIST_NAME"),
            Some(&Value::from("Claude Monet"))
        );
    }

    #[test]
    fn test_lock_failure_keeps_local_changes() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        fixture.db.update_rows(
            "ARTIST",
            &Qualifier::eq("ARTIST_ID", 1_i64),
            &[("ARTIST_NAME", Value::from("Changed elsewhere"))],
        );
        artist.write_property("name", "Mine").unwrap();

        let err = context.commit_changes().unwrap_err();
        let failure = err.optimistic_lock_failure().expect("lock failure cause");
        assert_eq!(failure.operation, "UPDATE");
        assert_eq!(failure.table, "ARTIST");
        assert_eq!(
            failure.fresh_snapshot().and_then(|row| row.get("ARTIST_NAME")),
            Some(&Value::from("Changed elsewhere"))
        );
        assert_eq!(artist.persistence_state(), PersistenceState::Modified);
        assert_eq!(artist.get::<String>("name").unwrap(), "Mine");
        assert!(context.has_changes());
        assert_eq!(
            fixture.db.rows("ARTIST")[0].get("ARTIST_NAME"),
            Some(&Value::from("Changed elsewhere"))
        );
    }

    #[test]
    fn test_failed_batch_rolls_back_everything() {
        let fixture = gallery();
        let context = fixture.context();
        let artist = context.new_object("Artist").unwrap();
        artist.write_property("name", "Monet").unwrap();
        let painting = context.new_object("Painting").unwrap();
        painting.set_to_one("artist", Some(&artist)).unwrap();
        fixture.db.fail_next_batch("PAINTING");

        let err = context.commit_changes().unwrap_err();
        assert!(matches!(err, Error::CommitAborted(_)));
        assert_eq!(fixture.db.row_count("ARTIST"), 0);
        assert!(artist.object_id().unwrap().is_temporary());
        assert_eq!(artist.persistence_state(), PersistenceState::New);
        assert_eq!(context.new_objects().len(), 2);

        context.commit_changes().unwrap();
        assert_eq!(fixture.db.row_count("ARTIST"), 1);
        assert_eq!(fixture.db.row_count("PAINTING"), 1);
    }

    #[test]
    fn test_children_are_deleted_before_parents() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        seed_painting(&fixture.db, 10, "Water Lilies", Some(1));
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        let painting = artist.to_many("paintings").unwrap().remove(0);

        context.delete_objects(&[artist, painting]).unwrap();
        context.commit_changes().unwrap();

        let tables: Vec<String> = fixture.db.batches().iter().map(|b| b.table().to_string()).collect();
        assert_eq!(tables, vec!["PAINTING", "ARTIST"]);
        assert_eq!(fixture.db.row_count("ARTIST"), 0);
        assert_eq!(fixture.db.row_count("PAINTING"), 0);
        assert_eq!(context.registered_objects_count(), 0);
    }

    #[test]
    fn test_deleted_object_leaves_no_cached_snapshot() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        let context = fixture.context();
        let other = fixture.context();
        let id = ObjectId::single("Artist", "ARTIST_ID", 1);
        let artist = context.object_for_id(&id).unwrap().unwrap();
        other.object_for_id(&id).unwrap().unwrap();
        assert!(context.get_cached_snapshot(&id).is_some());

        context.delete_object(&artist).unwrap();
        context.commit_changes().unwrap();

        assert!(artist.object_id().is_none());
        assert!(context.get_cached_snapshot(&id).is_none());
        assert!(other.get_node(&id).is_none());
        assert!(other.object_for_id(&id).unwrap().is_none());
    }

    #[test]
    fn test_nullify_writes_null_foreign_key() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        seed_painting(&fixture.db, 10, "Water Lilies", Some(1));
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        let painting = artist.to_many("paintings").unwrap().remove(0);

        context.delete_object(&artist).unwrap();
        context.commit_changes().unwrap();

        assert_eq!(fixture.db.row_count("ARTIST"), 0);
        assert_eq!(fixture.db.rows("PAINTING")[0].get("ARTIST_ID"), Some(&Value::Null));
        assert!(painting.to_one("artist").unwrap().is_none());
        assert_eq!(painting.persistence_state(), PersistenceState::Committed);
    }

    #[test]
    fn test_many_to_many_writes_link_rows() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet")]);
        fixture
            .db
            .insert_row("ARTGROUP", DataRow::new().with("GROUP_ID", 5_i64).with("NAME", "Impressionists"))
            .unwrap();
        let context = fixture.context();
        let artist = context.select(&ObjectSelect::query("Artist")).unwrap().remove(0);
        let group = context.select(&ObjectSelect::query("ArtGroup")).unwrap().remove(0);

        artist.add_to_many("groups", &group).unwrap();
        context.commit_changes().unwrap();
        let links = fixture.db.rows("ARTIST_GROUP");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].get("ARTIST_ID"), Some(&Value::BigInt(1)));
        assert_eq!(links[0].get("GROUP_ID"), Some(&Value::BigInt(5)));

        artist.remove_from_many("groups", &group).unwrap();
        context.commit_changes().unwrap();
        assert_eq!(fixture.db.row_count("ARTIST_GROUP"), 0);
    }

    #[test]
    fn test_reverted_changes_commit_nothing() {
        let fixture = gallery();
        seed_artists(&fixture.db, &[(1, "Monet"), (2, "Manet")]);
        let context = fixture.context();
        let artists = context
            .select(&ObjectSelect::query("Artist").order_by(OrderBy::asc("ARTIST_ID")))
            .unwrap();
        artists[0].write_property("name", "Other").unwrap();
        artists[0].write_property("name", "Monet").unwrap();

        context.commit_changes().unwrap();
        assert!(fixture.db.batches().is_empty());
        assert_eq!(artists[0].persistence_state(), PersistenceState::Committed);
    }

    #[test]
    fn test_subentity_insert_writes_its_discriminator() {
        let fixture = gallery();
        let context = fixture.context();
        let sketch = context.new_object("Sketch").unwrap();
        sketch.write_property("title", "Study").unwrap();
        context.commit_changes().unwrap();

        let rows = fixture.db.rows("PAINTING");
        assert_eq!(rows[0].get("KIND"), Some(&Value::from("S")));
        assert_eq!(sketch.object_id().unwrap().entity_name(), "Sketch");
    }
}
