pub mod bacass;
