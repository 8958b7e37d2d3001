mod configuration_tests;
mod round_trip_tests;
