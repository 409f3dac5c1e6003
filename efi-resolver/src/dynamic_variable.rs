//! Thread-local boolean switches with dynamic extent.

/// Defines a thread-local switch `$varname`, off by default, with a public function
/// `$with_var_set(f)` that turns it on for the duration of `f`, and a private function
/// `$if_var_set(then_f, else_f)` that branches on it.
///
/// Used to select between printed views of IL (e.g., showing derived field information) from
/// inside `Display` impls, whose signatures leave no room for extra arguments. The previous
/// setting is restored even if `f` unwinds.
macro_rules! dynamic_variable {
    ($varname:ident, $with_var_set:ident, $if_var_set:ident) => {
        thread_local! {
            static $varname: std::cell::Cell<bool> = std::cell::Cell::new(false);
        }

        #[allow(non_snake_case)]
        pub fn $with_var_set<T>(f: impl FnOnce() -> T) -> T {
            struct Restore(bool);
            impl Drop for Restore {
                fn drop(&mut self) {
                    $varname.with(|flag| flag.set(self.0));
                }
            }
            let _restore = Restore($varname.with(|flag| flag.replace(true)));
            f()
        }

        #[allow(non_snake_case)]
        fn $if_var_set<T>(then_f: impl FnOnce() -> T, else_f: impl FnOnce() -> T) -> T {
            if $varname.with(std::cell::Cell::get) {
                then_f()
            } else {
                else_f()
            }
        }
    };
}

pub(crate) use dynamic_variable;

#[cfg(test)]
mod test {
    dynamic_variable!(VERBOSE, with_VERBOSE_set, if_VERBOSE_set);

    fn verbose() -> bool {
        if_VERBOSE_set(|| true, || false)
    }

    #[test]
    fn switch_is_scoped() {
        assert!(!verbose());
        with_VERBOSE_set(|| {
            assert!(verbose());
            with_VERBOSE_set(|| assert!(verbose()));
            // Leaving the inner scope keeps the outer setting
            assert!(verbose());
        });
        assert!(!verbose());

        let unwound = std::panic::catch_unwind(|| with_VERBOSE_set(|| panic!("inside")));
        assert!(unwound.is_err());
        assert!(!verbose());
    }
}
