//! Folding observations that share `(id, session)` into one.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::entity::ObservedEntity;
use crate::instance::EntityRef;
use crate::merge::{merge_aux, merge_entities};
use crate::{Observation, ObservationConsents, Relation};

/// Merge observations into one per distinct `(id, session id)` key.
///
/// Each group is ordered oldest to newest by [`Observation::earliest_key`];
/// entities are folded with [`merge_entities`] in that order, relations from
/// every member are sorted chronologically, and scalar fields come from the
/// newest member.
///
/// Groups are returned in order of first appearance in the input. This is a
/// convenience of the implementation, not a guarantee: sort the output if a
/// stable order matters.
pub fn merge_observations<I>(observations: I) -> Vec<Observation>
where
    I: IntoIterator,
    I::Item: Borrow<Observation>,
{
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<I::Item>> = Vec::new();

    for observation in observations {
        let (id, session) = <I::Item as Borrow<Observation>>::borrow(&observation).key();
        let key = (id.to_string(), session.to_string());
        match index.get(&key) {
            Some(&slot) => groups[slot].push(observation),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![observation]);
            }
        }
    }

    tracing::debug!(groups = groups.len(), "merging observations");

    groups
        .into_iter()
        .filter_map(|mut group| {
            group.sort_by_key(|o| <I::Item as Borrow<Observation>>::borrow(o).earliest_key());
            let members: Vec<&Observation> = group
                .iter()
                .map(<I::Item as Borrow<Observation>>::borrow)
                .collect();
            merge_group(&members)
        })
        .collect()
}

fn merge_group(members: &[&Observation]) -> Option<Observation> {
    let newest = *members.last()?;

    let mut entities: BTreeMap<EntityRef, ObservedEntity> = BTreeMap::new();
    for observation in members {
        for (reference, entity) in &observation.entities {
            let merged = match entities.get(reference) {
                Some(existing) => merge_entities(existing, entity),
                None => entity.clone(),
            };
            entities.insert(reference.clone(), merged);
        }
    }

    let mut relations: Vec<Relation> = members
        .iter()
        .flat_map(|o| o.relations.iter().cloned())
        .collect();
    relations.sort_by_key(Relation::sort_key);

    let mut context: Vec<EntityRef> = Vec::new();
    for reference in members.iter().flat_map(|o| o.context.iter()) {
        if !context.contains(reference) {
            context.push(reference.clone());
        }
    }

    let aux = members
        .iter()
        .fold(None, |acc, o| merge_aux(acc.as_ref(), o.aux.as_ref()));

    let mut session = newest.session.clone();
    session.id = members[0].session.id.clone();

    Some(Observation {
        id: members[0].id.clone(),
        observer: newest.observer.clone(),
        name: newest.name.clone(),
        aspect: newest.aspect.clone(),
        source: newest.source.clone(),
        session,
        entities,
        relations,
        context,
        metadata: newest.metadata.clone(),
        consents: merge_observation_consents(members),
        aux,
    })
}

fn merge_observation_consents(members: &[&Observation]) -> Option<ObservationConsents> {
    let declared: Vec<&ObservationConsents> =
        members.iter().filter_map(|o| o.consents.as_ref()).collect();
    if declared.is_empty() {
        return None;
    }
    let granted: BTreeSet<String> = declared
        .iter()
        .flat_map(|c| c.granted.iter().cloned())
        .collect();
    Some(ObservationConsents {
        allow: declared.iter().all(|c| c.allow),
        granted,
    })
}
