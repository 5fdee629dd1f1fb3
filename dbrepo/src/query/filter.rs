use crate::entity::EntityType;
use crate::errors::{Error, Result};
use crate::fields::{self, FieldDefinition};
use crate::query::expression;
use crate::query::field::QueryField;
use crate::query::group::QueryGroup;
use crate::types::{Row, Value};

/// Every shape a `where` argument can take.
///
/// Operations accept `impl Into<Filter>`, so callers usually pass the underlying value directly:
///
/// ```ignore
/// repo.count::<Customer>((), None).await?;                              // no filter
/// repo.count::<Customer>("name LIKE 'A%'", None).await?;               // expression
/// repo.count::<Customer>(QueryField::equal("id", 5), None).await?;     // one comparison
/// repo.count::<Customer>(Row::new().with("name", "Ada"), None).await?; // key/value object
/// repo.delete::<Customer>(Filter::PrimaryKey(5.into()), None).await?;  // primary key value
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    #[default]
    None,
    /// Implicit AND of equalities, one per column, in column order
    Object(Row),
    /// Equality on the entity's primary key
    PrimaryKey(Value),
    /// Predicate text, see [`expression`](crate::query::expression)
    Expression(String),
    Field(QueryField),
    /// Implicit AND, in the given order
    Fields(Vec<QueryField>),
    Group(QueryGroup),
}

impl Filter {
    /// Convert into the canonical query group; `None` means "no filter".
    ///
    /// `definitions` resolves the primary key for [`Filter::PrimaryKey`] when the entity does
    /// not declare one.
    pub fn normalize(self, entity: &EntityType, definitions: Option<&[FieldDefinition]>) -> Result<Option<QueryGroup>> {
        let group = match self {
            Filter::None => return Ok(None),
            Filter::Object(row) => QueryGroup::and(row.into_iter().map(|(column, value)| QueryField::equal(column, value)).collect()),
            Filter::PrimaryKey(value) => {
                let key = primary_key(entity, definitions)?;
                QueryGroup::and(vec![QueryField::equal(key, value)])
            }
            Filter::Expression(text) if text.trim().is_empty() => return Ok(None),
            Filter::Expression(text) => expression::parse(&text)?,
            Filter::Field(field) => QueryGroup::and(vec![field]),
            Filter::Fields(fields) => QueryGroup::and(fields),
            Filter::Group(group) => group,
        };

        // validate first: it bounds the depth every later recursive pass walks
        group.validate()?;
        Ok(group.canonicalize())
    }
}

/// Primary key column: the entity's declaration wins, then the field definitions.
pub(crate) fn primary_key(entity: &EntityType, definitions: Option<&[FieldDefinition]>) -> Result<String> {
    if let Some(key) = entity.primary_key {
        return Ok(key.to_string());
    }
    definitions
        .and_then(fields::primary)
        .map(|definition| definition.name.clone())
        .ok_or_else(|| Error::configuration(format!("entity {entity} has no primary key")))
}

impl From<()> for Filter {
    fn from(_: ()) -> Self {
        Filter::None
    }
}

impl From<&str> for Filter {
    fn from(text: &str) -> Self {
        Filter::Expression(text.to_string())
    }
}

impl From<String> for Filter {
    fn from(text: String) -> Self {
        Filter::Expression(text)
    }
}

impl From<Row> for Filter {
    fn from(row: Row) -> Self {
        Filter::Object(row)
    }
}

impl From<QueryField> for Filter {
    fn from(field: QueryField) -> Self {
        Filter::Field(field)
    }
}

impl From<Vec<QueryField>> for Filter {
    fn from(fields: Vec<QueryField>) -> Self {
        Filter::Fields(fields)
    }
}

impl From<QueryGroup> for Filter {
    fn from(group: QueryGroup) -> Self {
        Filter::Group(group)
    }
}

impl<T: Into<Filter>> From<Option<T>> for Filter {
    fn from(filter: Option<T>) -> Self {
        filter.map(Into::into).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::field::Operation;
    use crate::query::group::Conjunction;
    use crate::test_utils::{Customer, Invoice};

    fn customer() -> EntityType {
        EntityType::of::<Customer>()
    }

    #[test]
    fn none_and_empty_shapes_normalize_to_no_filter() {
        let entity = customer();

        assert_eq!(Filter::None.normalize(&entity, None).unwrap(), None);
        assert_eq!(Filter::from("   ").normalize(&entity, None).unwrap(), None);
        assert_eq!(Filter::Fields(vec![]).normalize(&entity, None).unwrap(), None);
        assert_eq!(Filter::Object(Row::new()).normalize(&entity, None).unwrap(), None);
        assert_eq!(
            Filter::Group(QueryGroup::and(vec![]).with_group(QueryGroup::or(vec![])))
                .normalize(&entity, None)
                .unwrap(),
            None
        );
        assert_eq!(Filter::from(None::<QueryField>).normalize(&entity, None).unwrap(), None);
    }

    #[test]
    fn object_becomes_and_of_equalities_in_column_order() {
        let row = Row::new().with("name", "Ada").with("email", "ada@example.com");
        let group = Filter::from(row).normalize(&customer(), None).unwrap().unwrap();

        assert_eq!(group.conjunction, Conjunction::And);
        assert_eq!(
            group.fields,
            vec![QueryField::equal("name", "Ada"), QueryField::equal("email", "ada@example.com")]
        );
    }

    #[test]
    fn single_field_and_field_list_match_equivalent_expression() {
        let entity = customer();
        let from_field = Filter::from(QueryField::equal("id", 5_i64)).normalize(&entity, None).unwrap();
        let from_list = Filter::from(vec![QueryField::equal("id", 5_i64)]).normalize(&entity, None).unwrap();
        let from_text = Filter::from("id == 5").normalize(&entity, None).unwrap();

        assert_eq!(from_field, from_list);
        assert_eq!(from_field, from_text);
    }

    #[test]
    fn primary_key_uses_entity_declaration() {
        let group = Filter::PrimaryKey(7_i64.into()).normalize(&customer(), None).unwrap().unwrap();
        assert_eq!(group.fields, vec![QueryField::equal("id", 7_i64)]);
    }

    #[test]
    fn primary_key_falls_back_to_definitions() {
        let definitions = vec![
            FieldDefinition::new("number", "text", 0).primary(),
            FieldDefinition::new("total", "numeric", 1),
        ];
        let group = Filter::PrimaryKey("INV-1".into())
            .normalize(&EntityType::of::<Invoice>(), Some(&definitions))
            .unwrap()
            .unwrap();
        assert_eq!(group.fields, vec![QueryField::equal("number", "INV-1")]);
    }

    #[test]
    fn primary_key_without_any_key_is_a_configuration_error() {
        let err = Filter::PrimaryKey(1_i64.into())
            .normalize(&EntityType::of::<Invoice>(), None)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn malformed_group_fails_before_anything_is_built() {
        let err = Filter::from(QueryField::new("id", Operation::Between, 1_i64))
            .normalize(&customer(), None)
            .unwrap_err();
        assert!(matches!(err, Error::Normalization { .. }));
    }
}
