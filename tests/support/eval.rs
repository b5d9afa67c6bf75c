//! Reference evaluator for condition and update expressions, used by the
//! in-memory store and as the oracle for rewriter property tests.

use mtdb::error::MtdbError;
use mtdb::mapper::expression::{
    Cmp, CondExpr, NameToken, Operand, Path, PathElement, UpdateExpr, UpdateValue,
};
use mtdb::model::{AttributeValue, Item, NameMap, ValueMap};
use std::cmp::Ordering;

fn resolve_name(token: &NameToken, names: Option<&NameMap>) -> Result<String, MtdbError> {
    match token {
        NameToken::Ident(name) => Ok(name.to_string()),
        NameToken::Ref(name) => names
            .and_then(|names| names.get(format!("#{name}").as_str()))
            .map(|resolved| resolved.to_string())
            .ok_or_else(|| {
                MtdbError::MalformedExpression(format!("unresolved name placeholder '#{name}'"))
            }),
    }
}

fn resolve_path<'a>(
    path: &Path,
    item: &'a Item,
    names: Option<&NameMap>,
) -> Result<Option<&'a AttributeValue>, MtdbError> {
    let mut elements = path.0.iter();
    let root = match elements.next() {
        Some(PathElement::Attr(token)) => resolve_name(token, names)?,
        _ => return Ok(None),
    };
    let mut current = match item.get(root.as_str()) {
        Some(value) => value,
        None => return Ok(None),
    };
    for element in elements {
        current = match (element, current) {
            (PathElement::Attr(token), AttributeValue::M(map)) => {
                let name = resolve_name(token, names)?;
                match map.get(name.as_str()) {
                    Some(value) => value,
                    None => return Ok(None),
                }
            }
            (PathElement::Index(i), AttributeValue::L(list)) => {
                match list.get(*i as usize) {
                    Some(value) => value,
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

fn operand_value(
    operand: &Operand,
    item: &Item,
    names: Option<&NameMap>,
    values: Option<&ValueMap>,
) -> Result<Option<AttributeValue>, MtdbError> {
    match operand {
        Operand::Path(path) => Ok(resolve_path(path, item, names)?.cloned()),
        Operand::ValueRef(name) => values
            .and_then(|values| values.get(format!(":{name}").as_str()))
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                MtdbError::MalformedExpression(format!("unresolved value placeholder ':{name}'"))
            }),
        Operand::StringLit(value) => Ok(Some(AttributeValue::s(value.clone()))),
        Operand::NumberLit(value) => Ok(Some(AttributeValue::n(value.clone()))),
        Operand::Size(path) => {
            let size = match resolve_path(path, item, names)? {
                Some(AttributeValue::S(s)) => Some(s.chars().count()),
                Some(AttributeValue::B(b)) => Some(b.len()),
                Some(AttributeValue::L(l)) => Some(l.len()),
                Some(AttributeValue::M(m)) => Some(m.len()),
                _ => None,
            };
            Ok(size.map(|n| AttributeValue::n(n.to_string())))
        }
    }
}

pub fn numeric_cmp(a: &str, b: &str) -> Option<Ordering> {
    let a: f64 = a.parse().ok()?;
    let b: f64 = b.parse().ok()?;
    Some(a.total_cmp(&b))
}

fn compare(a: &AttributeValue, b: &AttributeValue) -> Option<Ordering> {
    match (a, b) {
        (AttributeValue::N(x), AttributeValue::N(y)) => numeric_cmp(x, y),
        (AttributeValue::S(x), AttributeValue::S(y)) => Some(x.cmp(y)),
        (AttributeValue::B(x), AttributeValue::B(y)) => Some(x.cmp(y)),
        (AttributeValue::Bool(x), AttributeValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn eval_condition(
    expr: &CondExpr,
    item: &Item,
    names: Option<&NameMap>,
    values: Option<&ValueMap>,
) -> Result<bool, MtdbError> {
    match expr {
        CondExpr::Compare(cmp, lhs, rhs) => {
            let lhs = operand_value(lhs, item, names, values)?;
            let rhs = operand_value(rhs, item, names, values)?;
            let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
                return Ok(false);
            };
            let Some(ordering) = compare(&lhs, &rhs) else {
                return Ok(false);
            };
            Ok(match cmp {
                Cmp::Eq => ordering.is_eq(),
                Cmp::Ne => !ordering.is_eq(),
                Cmp::Lt => ordering.is_lt(),
                Cmp::Le => ordering.is_le(),
                Cmp::Gt => ordering.is_gt(),
                Cmp::Ge => ordering.is_ge(),
            })
        }
        CondExpr::Between(subject, low, high) => {
            let subject = operand_value(subject, item, names, values)?;
            let low = operand_value(low, item, names, values)?;
            let high = operand_value(high, item, names, values)?;
            let (Some(subject), Some(low), Some(high)) = (subject, low, high) else {
                return Ok(false);
            };
            Ok(compare(&subject, &low).is_some_and(|o| o.is_ge())
                && compare(&subject, &high).is_some_and(|o| o.is_le()))
        }
        CondExpr::In(subject, members) => {
            let Some(subject) = operand_value(subject, item, names, values)? else {
                return Ok(false);
            };
            for member in members {
                if operand_value(member, item, names, values)?
                    .is_some_and(|m| compare(&subject, &m).is_some_and(|o| o.is_eq()))
                {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        CondExpr::AttributeExists(path) => Ok(resolve_path(path, item, names)?.is_some()),
        CondExpr::AttributeNotExists(path) => Ok(resolve_path(path, item, names)?.is_none()),
        CondExpr::AttributeType(path, operand) => {
            let Some(value) = resolve_path(path, item, names)? else {
                return Ok(false);
            };
            let Some(AttributeValue::S(tag)) = operand_value(operand, item, names, values)? else {
                return Ok(false);
            };
            Ok(value.type_tag() == tag)
        }
        CondExpr::BeginsWith(path, operand) => {
            let value = resolve_path(path, item, names)?;
            let prefix = operand_value(operand, item, names, values)?;
            match (value, prefix) {
                (Some(AttributeValue::S(value)), Some(AttributeValue::S(prefix))) => {
                    Ok(value.starts_with(prefix.as_str()))
                }
                _ => Ok(false),
            }
        }
        CondExpr::Contains(path, operand) => {
            let value = resolve_path(path, item, names)?;
            let needle = operand_value(operand, item, names, values)?;
            match (value, needle) {
                (Some(AttributeValue::S(value)), Some(AttributeValue::S(needle))) => {
                    Ok(value.contains(needle.as_str()))
                }
                (Some(AttributeValue::L(list)), Some(needle)) => {
                    Ok(list.iter().any(|member| member == &needle))
                }
                _ => Ok(false),
            }
        }
        CondExpr::And(lhs, rhs) => Ok(eval_condition(lhs, item, names, values)?
            && eval_condition(rhs, item, names, values)?),
        CondExpr::Or(lhs, rhs) => Ok(eval_condition(lhs, item, names, values)?
            || eval_condition(rhs, item, names, values)?),
        CondExpr::Not(inner) => Ok(!eval_condition(inner, item, names, values)?),
    }
}

fn numeric_add(a: &str, b: &str, subtract: bool) -> Result<AttributeValue, MtdbError> {
    let a: f64 = a
        .parse()
        .map_err(|_| MtdbError::Validation(format!("not a number: '{a}'")))?;
    let b: f64 = b
        .parse()
        .map_err(|_| MtdbError::Validation(format!("not a number: '{b}'")))?;
    let result = if subtract { a - b } else { a + b };
    let text = if result.fract() == 0.0 && result.abs() < 1e15 {
        format!("{}", result as i64)
    } else {
        format!("{result}")
    };
    Ok(AttributeValue::n(text))
}

/// Applies a parsed update expression to an item in place. Nested paths are
/// limited to root attributes, which is all the fixtures use.
pub fn apply_update(
    item: &mut Item,
    update: &UpdateExpr,
    names: Option<&NameMap>,
    values: Option<&ValueMap>,
) -> Result<(), MtdbError> {
    let root = |path: &Path| -> Result<String, MtdbError> {
        match &path.0[0] {
            PathElement::Attr(token) => resolve_name(token, names),
            PathElement::Index(_) => {
                Err(MtdbError::MalformedExpression("path starts with index".into()))
            }
        }
    };

    for (path, value) in &update.set {
        let snapshot = item.clone();
        let resolved = match value {
            UpdateValue::Operand(operand) => operand_value(operand, &snapshot, names, values)?
                .ok_or_else(|| MtdbError::Validation("SET operand is absent".into()))?,
            UpdateValue::Plus(lhs, rhs) | UpdateValue::Minus(lhs, rhs) => {
                let lhs = operand_value(lhs, &snapshot, names, values)?;
                let rhs = operand_value(rhs, &snapshot, names, values)?;
                match (lhs, rhs) {
                    (Some(AttributeValue::N(a)), Some(AttributeValue::N(b))) => {
                        numeric_add(&a, &b, matches!(value, UpdateValue::Minus(_, _)))?
                    }
                    _ => return Err(MtdbError::Validation("arithmetic needs numbers".into())),
                }
            }
            UpdateValue::IfNotExists(path, fallback) => {
                match resolve_path(path, &snapshot, names)? {
                    Some(existing) => existing.clone(),
                    None => operand_value(fallback, &snapshot, names, values)?.ok_or_else(|| {
                        MtdbError::Validation("if_not_exists fallback is absent".into())
                    })?,
                }
            }
            UpdateValue::ListAppend(lhs, rhs) => {
                let lhs = operand_value(lhs, &snapshot, names, values)?;
                let rhs = operand_value(rhs, &snapshot, names, values)?;
                match (lhs, rhs) {
                    (Some(AttributeValue::L(mut a)), Some(AttributeValue::L(b))) => {
                        a.extend(b);
                        AttributeValue::L(a)
                    }
                    _ => return Err(MtdbError::Validation("list_append needs lists".into())),
                }
            }
        };
        item.insert(root(path)?.into(), resolved);
    }
    for path in &update.remove {
        item.remove(root(path)?.as_str());
    }
    for (path, operand) in &update.add {
        let name = root(path)?;
        let addend = operand_value(operand, &item.clone(), names, values)?
            .ok_or_else(|| MtdbError::Validation("ADD operand is absent".into()))?;
        let merged = match (item.get(name.as_str()), &addend) {
            (Some(AttributeValue::N(a)), AttributeValue::N(b)) => numeric_add(a, b, false)?,
            (None, AttributeValue::N(_)) => addend.clone(),
            _ => return Err(MtdbError::Validation("ADD supports numbers only".into())),
        };
        item.insert(name.into(), merged);
    }
    for (path, _) in &update.delete {
        // set-typed DELETE is not modeled; dropping the attribute is close
        // enough for the fixtures
        item.remove(root(path)?.as_str());
    }
    Ok(())
}
