#![allow(clippy::unwrap_used)]
//! Compiler behaviour that only matters at scale: deeply nested and very
//! wide expressions must compile without stack growth proportional to the
//! input.

use std::collections::HashSet;

use ad_searcher::Filter;

const OPERANDS: usize = 1 << 14;

#[test]
fn very_wide_and_chain_compiles() {
	let operands: Vec<Filter> =
		(0..OPERANDS).map(|i| Filter::equals("cn", format!("user{i}"))).collect();
	let compiled = Filter::and(operands).compile(&HashSet::new()).unwrap();
	assert!(compiled.starts_with("(&(cn=user0)"));
	assert!(compiled.ends_with(")"));
	assert!(
		compiled.len() > OPERANDS * 8,
		"output must grow with the operand count, got {} bytes",
		compiled.len()
	);
}

#[test]
fn deep_balanced_tree_compiles() {
	fn balanced(depth: u32, counter: &mut usize) -> Filter {
		if depth == 0 {
			*counter += 1;
			Filter::equals("cn", format!("leaf{counter}"))
		} else {
			Filter::and(vec![balanced(depth - 1, counter), balanced(depth - 1, counter)])
		}
	}

	let mut leaves = 0;
	let tree = balanced(14, &mut leaves);
	let compiled = tree.compile(&HashSet::new()).unwrap();
	assert_eq!(leaves, OPERANDS);
	assert!(compiled.len() > OPERANDS * 8);
}

#[test]
fn deep_not_chain_compiles() {
	let mut filter = Filter::equals("cn", "innermost");
	for _ in 0..OPERANDS {
		filter = Filter::not(filter);
	}
	let compiled = filter.compile(&HashSet::new()).unwrap();
	assert!(compiled.starts_with("(!(!"));
	assert_eq!(compiled.len(), OPERANDS * 3 + "(cn=innermost)".len());
}

#[test]
fn wide_one_of_matches_the_equivalent_or() {
	let values: Vec<String> = (0..2000).map(|i| format!("cn=group{i},dc=example,dc=org")).collect();
	let booleans = HashSet::new();
	let one_of = Filter::one_of("memberOf", values.clone()).compile(&booleans).unwrap();
	let or = Filter::or(values.into_iter().map(|v| Filter::equals("memberOf", v)).collect())
		.compile(&booleans)
		.unwrap();
	assert_eq!(one_of, or);
}
