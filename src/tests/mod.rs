pub mod support;

mod contract_tests;
