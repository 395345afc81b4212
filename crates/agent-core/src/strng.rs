//! Interned, cheaply-cloneable string type used throughout the gateway for
//! anything that ends up cloned across requests (backend names, model ids,
//! header values).

pub type Strng = arcstr::ArcStr;

/// Build a `Strng` from a `&'static str` without an allocation.
pub const fn literal(s: &'static str) -> Strng {
	arcstr::literal!(s)
}

pub fn new(s: impl AsRef<str>) -> Strng {
	Strng::from(s.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn literal_is_static() {
		let a = literal("hello");
		let b = literal("hello");
		assert_eq!(a, b);
	}

	#[test]
	fn new_from_owned() {
		let s = new(format!("backend-{}", 1));
		assert_eq!(s.as_str(), "backend-1");
	}
}
