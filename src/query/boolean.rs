//! Evaluate a parsed boolean query.
//!
//! Atoms of one conjunction share a single [`Query`] so that the cost
//! ordering sees all of them. Nested groups are evaluated on their own and
//! intersected in, and negated terms are subtracted last. A negated term is
//! always evaluated in full: subtracting a partial set would leave ids the
//! complete answer excludes.

use super::evaluate::Query;
use super::filter::Indexable;
use super::parse::{QueryNode, parse_query};
use super::result::QueryResult;
use crate::error::{FramedexError, Result};
use crate::session::Session;
use crate::types::QueryOptions;

/// Parse and evaluate `text` against `session`.
pub fn boolean_result<'s>(session: &'s Session, text: &str) -> Result<QueryResult<'s>> {
    let node = parse_query(text)?;
    evaluate_node(session, &node, session.options().query)
}

/// Whether one entry's indexable text satisfies `node`, checked without any
/// index. Negation is allowed anywhere here.
pub fn node_matches(session: &Session, node: &QueryNode, doc: &Indexable) -> Result<bool> {
    match node {
        QueryNode::Not(inner) => Ok(!node_matches(session, inner, doc)?),
        QueryNode::Or(items) => {
            for item in items {
                if node_matches(session, item, doc)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        QueryNode::And(items) => {
            for item in items {
                if !node_matches(session, item, doc)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        atom => {
            let mut query = Query::new(session);
            add_atom(&mut query, atom)?;
            Ok(query.filters().all(|(_, filter)| filter.matches(doc)))
        }
    }
}

fn evaluate_node<'s>(
    session: &'s Session,
    node: &QueryNode,
    options: QueryOptions,
) -> Result<QueryResult<'s>> {
    match node {
        QueryNode::Not(_) => Err(FramedexError::invalid_query("unrestricted negation")),
        QueryNode::Or(items) => disjunction(session, items, options),
        QueryNode::And(items) => conjunction(session, items, options),
        atom => conjunction(session, std::slice::from_ref(atom), options),
    }
}

fn disjunction<'s>(
    session: &'s Session,
    items: &[QueryNode],
    options: QueryOptions,
) -> Result<QueryResult<'s>> {
    let mut results = items
        .iter()
        .map(|item| evaluate_node(session, item, options));
    let Some(first) = results.next() else {
        return Err(FramedexError::invalid_query("null query"));
    };
    let mut combined = first?;
    for result in results {
        combined.union(result?);
    }
    Ok(combined)
}

fn conjunction<'s>(
    session: &'s Session,
    items: &[QueryNode],
    options: QueryOptions,
) -> Result<QueryResult<'s>> {
    let mut query = Query::new(session).with_options(options);
    let mut nested = Vec::new();
    let mut negated = Vec::new();
    for item in items {
        match item {
            QueryNode::Not(inner) => negated.push(inner.as_ref()),
            QueryNode::Or(_) | QueryNode::And(_) => nested.push(item),
            atom => add_atom(&mut query, atom)?,
        }
    }
    if query.is_empty() && nested.is_empty() {
        return Err(FramedexError::invalid_query(if negated.is_empty() {
            "null query"
        } else {
            "negative-only query"
        }));
    }

    let mut result = if query.is_empty() {
        None
    } else {
        Some(query.evaluate()?)
    };
    for group in nested {
        if result.as_ref().is_some_and(QueryResult::is_empty) {
            break;
        }
        let evaluated = evaluate_node(session, group, options)?;
        match result.as_mut() {
            Some(current) => current.intersect(evaluated),
            None => result = Some(evaluated),
        }
    }
    let Some(mut result) = result else {
        return Err(FramedexError::invalid_query("null query"));
    };
    for term in negated {
        if result.is_empty() {
            break;
        }
        let group = negated_group(term);
        match evaluate_node(session, &group, exhaustive(options)) {
            Ok(excluded) if !excluded.is_truncated() => result.difference(&excluded)?,
            Ok(_) | Err(FramedexError::QueryOverflow) => {
                exclude_by_test(session, &mut result, &group)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(result)
}

/// Options with no row cap and no time limit.
fn exhaustive(options: QueryOptions) -> QueryOptions {
    QueryOptions {
        truncate_size: None,
        time_limit_ms: u64::MAX,
        ..options
    }
}

/// Drop every id of `result` whose entry (or, threaded, any ancestor) matches
/// `term`, testing the descriptions directly.
fn exclude_by_test(
    session: &Session,
    result: &mut QueryResult<'_>,
    term: &QueryNode,
) -> Result<()> {
    for id in result.all_identities()? {
        let chain = if result.is_threaded() {
            result.describe_thread(&id)?
        } else {
            vec![result.describe(&id)?]
        };
        let mut excluded = false;
        for entry in &chain {
            if node_matches(session, term, &session.indexable(entry))? {
                excluded = true;
                break;
            }
        }
        if excluded {
            result.remove(&id);
        }
    }
    Ok(())
}

/// A negated term evaluated on its own. A bare `Not` inside it is still
/// unrestricted, so it is wrapped as a one-item conjunction.
fn negated_group(term: &QueryNode) -> QueryNode {
    match term {
        QueryNode::Not(_) => QueryNode::And(vec![term.clone()]),
        other => other.clone(),
    }
}

fn add_atom(query: &mut Query<'_>, atom: &QueryNode) -> Result<()> {
    match atom {
        QueryNode::Prefix { attr, prefix } => query.prefix_attribute(attr, prefix)?,
        QueryNode::AttrWord { attr, word } => query.attribute_word(attr, word)?,
        QueryNode::AnyWord(word) => query.any_word(word)?,
        QueryNode::Range { attr, low, high } => query.attribute_range(attr, low, high)?,
        QueryNode::Match { attr, value } => query.match_attribute(attr, value)?,
        QueryNode::Proximate { limit, words } => query.proximate_words(words, *limit)?,
        QueryNode::Or(_) | QueryNode::And(_) | QueryNode::Not(_) => {
            return Err(FramedexError::invalid_query("expected an atom"));
        }
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::types::SessionOptions;

    #[test]
    fn negation_needs_a_positive_term() {
        let dir = TempDir::new().unwrap();
        let session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        for text in ["~fox", "~fox ~quick", "~fox | quick"] {
            let err = boolean_result(&session, text).unwrap_err();
            assert!(matches!(err, FramedexError::InvalidQuery { .. }), "{text}: {err}");
        }
    }

    #[test]
    fn nested_groups_combine() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        for (id, text) in [("a", "red apple"), ("b", "green apple"), ("c", "red cherry")] {
            session
                .index_document(id, [("text".to_owned(), text.into())].into())
                .unwrap();
        }
        session.store(None).unwrap();
        let ids = |text: &str| boolean_result(&session, text).unwrap().identities().unwrap();
        assert_eq!(ids("red (apple | cherry)"), vec!["a", "c"]);
        assert_eq!(ids("(red | green) ~cherry"), vec!["a", "b"]);
        assert_eq!(ids("apple ~(green | cherry)"), vec!["a"]);
        assert!(ids("apple cherry").is_empty());
    }

    #[test]
    fn truncated_positive_terms_still_drop_every_negated_match() {
        let dir = TempDir::new().unwrap();
        let mut options = SessionOptions::default();
        options.query.truncate_size = Some(2);
        let mut session = Session::create(dir.path(), None, options).unwrap();
        for (id, text) in [("a0", "quick"), ("a1", "quick"), ("b", "fox quick"), ("c", "fox")] {
            session
                .index_document(id, [("text".to_owned(), text.into())].into())
                .unwrap();
        }
        session.store(None).unwrap();

        let result = boolean_result(&session, "fox ~quick").unwrap();
        assert!(result.is_truncated());
        assert_eq!(result.identities().unwrap(), vec!["c"]);
    }

    #[test]
    fn overflowing_negation_falls_back_to_testing() {
        let dir = TempDir::new().unwrap();
        let mut options = SessionOptions::default();
        options.query.max_buffer = 3;
        let mut session = Session::create(dir.path(), None, options).unwrap();
        for i in 0..6 {
            session
                .index_document(
                    &format!("w{i}"),
                    [("text".to_owned(), "common word".into())].into(),
                )
                .unwrap();
        }
        session
            .index_document("r", [("text".to_owned(), "rare word".into())].into())
            .unwrap();
        session
            .index_document("s", [("text".to_owned(), "rare common".into())].into())
            .unwrap();
        session.store(None).unwrap();

        assert!(matches!(
            boolean_result(&session, "common"),
            Err(FramedexError::QueryOverflow)
        ));
        let result = boolean_result(&session, "rare ~common").unwrap();
        assert!(!result.is_truncated());
        assert_eq!(result.identities().unwrap(), vec!["r"]);
    }

    #[test]
    fn node_matches_checks_one_entry() {
        let dir = TempDir::new().unwrap();
        let session = Session::create(dir.path(), None, SessionOptions::default()).unwrap();
        let doc: Indexable = [("text".to_owned(), vec!["red apple".to_owned()])].into();
        let check = |text: &str| node_matches(&session, &parse_query(text).unwrap(), &doc).unwrap();
        assert!(check("red apple"));
        assert!(check("red ~cherry"));
        assert!(check("cherry | apple"));
        assert!(!check("red ~(apple | cherry)"));
        assert!(check("text=\"red apple\""));
    }
}
